//! Persistent, pipelined store client.
//!
//! Commands are queued with [`StoreClient::issue`] (or one of the typed
//! helpers), written by [`StoreClient::flush`] and their replies collected by
//! [`StoreClient::read`], in issue order:
//!
//! ```rust,ignore
//! let replies = store
//!     .hsetnx("mail.pending", &id, now)
//!     .hgetall(format!("job.{id}"))
//!     .read()
//!     .await?
//!     .into_vec();
//! ```
//!
//! The connection is opened on first use and kept until a socket level
//! failure, which closes it and surfaces as [`StoreError::Io`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::codec::{self, Arg, Value};
use crate::error::StoreError;

/// Default port of the coordination store.
pub const DEFAULT_PORT: u16 = 6379;

const READ_CHUNK: usize = 16 * 1024;

/// Connection settings for the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `tcp://host:port`, `redis://host:port` or `host:port`.
    pub dsn: String,
    /// Logical database selected after connecting.
    pub db: u32,
    /// Password sent with `AUTH` when set.
    #[serde(alias = "pwd")]
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: "tcp://127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
            connect_timeout_ms: 1000,
            io_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration for the given DSN.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Default::default()
        }
    }

    /// Sets the database index.
    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Sets the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the read/write timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Resolves the DSN into a `host:port` address.
    pub fn address(&self) -> Result<String, StoreError> {
        let rest = self
            .dsn
            .strip_prefix("tcp://")
            .or_else(|| self.dsn.strip_prefix("redis://"))
            .unwrap_or(&self.dsn);
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(StoreError::Connection(format!("invalid dsn '{}'", self.dsn)));
        }
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                port.parse::<u16>()
                    .map_err(|_| StoreError::Connection(format!("invalid port in '{}'", self.dsn)))?;
                Ok(format!("{}:{}", host, port))
            }
            None => Ok(format!("{}:{}", rest, DEFAULT_PORT)),
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }
}

/// Replies collected by [`StoreClient::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Exactly one command was pending.
    Single(Value),
    /// Several commands were pending; replies are in issue order.
    Batch(Vec<Value>),
}

impl Reply {
    /// The single reply, or the last reply of a batch.
    pub fn into_value(self) -> Value {
        match self {
            Self::Single(v) => v,
            Self::Batch(mut values) => values.pop().unwrap_or(Value::Nil),
        }
    }

    /// All replies in issue order.
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Self::Single(v) => vec![v],
            Self::Batch(values) => values,
        }
    }
}

/// Single-connection client for the coordination store.
pub struct StoreClient {
    config: StoreConfig,
    stream: Option<TcpStream>,
    /// Encoded commands not yet written.
    pending: Vec<u8>,
    /// Number of commands in `pending`.
    queued: usize,
    /// Number of written commands whose replies have not been read.
    awaiting: usize,
    buffer: Vec<u8>,
}

impl StoreClient {
    /// Creates a client; no connection is made until first use.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            stream: None,
            pending: Vec::new(),
            queued: 0,
            awaiting: 0,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the connection if none is open.
    pub async fn ensure_connected(&mut self) -> Result<(), StoreError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let address = self.config.address()?;
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| StoreError::Connection(format!("timed out connecting to {}", address)))?
            .map_err(|e| StoreError::Connection(format!("{}: {}", address, e)))?;
        // Nagle would hold back small pipelined batches.
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        self.buffer.clear();
        self.awaiting = 0;

        if let Err(e) = self.handshake().await {
            self.close();
            return Err(StoreError::Connection(format!("unable to connect: {}", e)));
        }
        debug!(address = %address, db = self.config.db, "Store connection established");
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), StoreError> {
        let mut out = Vec::new();
        let mut count = 0;
        if let Some(password) = self.config.password.clone().filter(|p| !p.is_empty()) {
            codec::encode_command(&mut out, "AUTH", &[password.into()]);
            count += 1;
        }
        codec::encode_command(&mut out, "SELECT", &[self.config.db.into()]);
        count += 1;

        self.write_all(&out).await?;
        for _ in 0..count {
            if let Value::Error(msg) = self.read_value().await? {
                return Err(StoreError::Server(msg));
            }
        }
        Ok(())
    }

    /// Drops the connection and anything queued on it.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Store connection closed");
        }
        self.buffer.clear();
        self.awaiting = 0;
    }

    /// Queues a command; nothing touches the network until flush or read.
    pub fn issue(&mut self, command: &str, args: Vec<Arg>) -> &mut Self {
        codec::encode_command(&mut self.pending, command, &args);
        self.queued += 1;
        self
    }

    /// Number of commands queued but not yet written.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Discards queued commands without sending them.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.queued = 0;
    }

    /// Writes every queued command.
    pub async fn flush(&mut self) -> Result<&mut Self, StoreError> {
        if self.queued == 0 {
            return Err(StoreError::NothingPending);
        }
        if let Err(e) = self.ensure_connected().await {
            self.discard();
            return Err(e);
        }
        let buffer = std::mem::take(&mut self.pending);
        let count = std::mem::replace(&mut self.queued, 0);
        self.write_all(&buffer).await?;
        self.awaiting += count;
        Ok(self)
    }

    /// Flushes queued commands, then reads one reply per written command.
    ///
    /// Every reply of the batch is consumed before an error reply is
    /// reported, so the connection stays in step with the server.
    pub async fn read(&mut self) -> Result<Reply, StoreError> {
        if self.queued > 0 {
            self.flush().await?;
        }
        if self.awaiting == 0 {
            return Err(StoreError::NothingPending);
        }
        let count = self.awaiting;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let value = self.read_value().await?;
            self.awaiting -= 1;
            values.push(value);
        }

        if let Some(msg) = values.iter().find_map(|v| match v {
            Value::Error(msg) => Some(msg.clone()),
            _ => None,
        }) {
            return Err(StoreError::Server(msg));
        }

        if values.len() == 1 {
            Ok(Reply::Single(values.remove(0)))
        } else {
            Ok(Reply::Batch(values))
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let timeout = self.config.io_timeout();
        let Some(stream) = self.stream.as_mut() else {
            return Err(StoreError::Io("not connected".to_string()));
        };
        let mut written = 0;
        while written < bytes.len() {
            let result = tokio::time::timeout(timeout, stream.write(&bytes[written..])).await;
            match result {
                Ok(Ok(0)) => {
                    return Err(self.io_failure("failed to write entire command to stream"));
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(self.io_failure(&e.to_string())),
                Err(_) => return Err(self.io_failure("write timed out")),
            }
        }
        Ok(())
    }

    async fn read_value(&mut self) -> Result<Value, StoreError> {
        let timeout = self.config.io_timeout();
        loop {
            match codec::decode(&self.buffer) {
                Ok(Some((value, used))) => {
                    self.buffer.drain(..used);
                    return Ok(value);
                }
                Ok(None) => {}
                Err(reason) => {
                    // The stream position is unknown past a malformed frame.
                    self.close();
                    return Err(StoreError::Protocol(reason));
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(StoreError::Io("not connected".to_string()));
            };
            let mut chunk = [0u8; READ_CHUNK];
            match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(self.io_failure("connection closed by the store")),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(self.io_failure(&e.to_string())),
                Err(_) => return Err(self.io_failure("read timed out")),
            }
        }
    }

    fn io_failure(&mut self, reason: &str) -> StoreError {
        warn!(reason = reason, "Store IO failure, closing connection");
        self.close();
        StoreError::Io(reason.to_string())
    }

    // Typed helpers for the commands the queue protocol relies on.

    pub fn ping(&mut self) -> &mut Self {
        self.issue("PING", Vec::new())
    }

    pub fn get(&mut self, key: impl Into<Arg>) -> &mut Self {
        self.issue("GET", vec![key.into()])
    }

    pub fn set(&mut self, key: impl Into<Arg>, value: impl Into<Arg>) -> &mut Self {
        self.issue("SET", vec![key.into(), value.into()])
    }

    pub fn del(&mut self, key: impl Into<Arg>) -> &mut Self {
        self.issue("DEL", vec![key.into()])
    }

    pub fn incr(&mut self, key: impl Into<Arg>) -> &mut Self {
        self.issue("INCR", vec![key.into()])
    }

    pub fn expire(&mut self, key: impl Into<Arg>, seconds: u64) -> &mut Self {
        self.issue("EXPIRE", vec![key.into(), seconds.into()])
    }

    pub fn hset(&mut self, key: impl Into<Arg>, field: impl Into<Arg>, value: impl Into<Arg>) -> &mut Self {
        self.issue("HSET", vec![key.into(), field.into(), value.into()])
    }

    /// Sets many fields at once from a flattened mapping.
    pub fn hmset<K, V, I>(&mut self, key: impl Into<Arg>, fields: I) -> &mut Self
    where
        K: Into<Arg>,
        V: Into<Arg>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.issue("HMSET", vec![key.into(), Arg::pairs(fields)])
    }

    pub fn hsetnx(&mut self, key: impl Into<Arg>, field: impl Into<Arg>, value: impl Into<Arg>) -> &mut Self {
        self.issue("HSETNX", vec![key.into(), field.into(), value.into()])
    }

    pub fn hget(&mut self, key: impl Into<Arg>, field: impl Into<Arg>) -> &mut Self {
        self.issue("HGET", vec![key.into(), field.into()])
    }

    pub fn hgetall(&mut self, key: impl Into<Arg>) -> &mut Self {
        self.issue("HGETALL", vec![key.into()])
    }

    pub fn hdel(&mut self, key: impl Into<Arg>, field: impl Into<Arg>) -> &mut Self {
        self.issue("HDEL", vec![key.into(), field.into()])
    }

    pub fn hincrby(&mut self, key: impl Into<Arg>, field: impl Into<Arg>, by: i64) -> &mut Self {
        self.issue("HINCRBY", vec![key.into(), field.into(), by.into()])
    }

    pub fn lpush(&mut self, key: impl Into<Arg>, value: impl Into<Arg>) -> &mut Self {
        self.issue("LPUSH", vec![key.into(), value.into()])
    }

    pub fn rpop(&mut self, key: impl Into<Arg>) -> &mut Self {
        self.issue("RPOP", vec![key.into()])
    }

    pub fn llen(&mut self, key: impl Into<Arg>) -> &mut Self {
        self.issue("LLEN", vec![key.into()])
    }

    pub fn lrange(&mut self, key: impl Into<Arg>, start: i64, stop: i64) -> &mut Self {
        self.issue("LRANGE", vec![key.into(), start.into(), stop.into()])
    }
}
