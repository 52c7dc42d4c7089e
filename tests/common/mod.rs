//! Shared helpers for the integration tests.
//!
//! [`FakeStore`] is an in-process TCP server speaking the store protocol,
//! built on the crate's own codec. It implements the command subset rjq uses
//! (strings, hashes, lists, expiry) with the same reply types as Redis.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use rjq::orchestrator::Context;
use rjq::queue::JobQueue;
use rjq::store::codec::{decode, encode_value};
use rjq::store::{StoreClient, StoreConfig, Value};
use rjq::worker::WorkerCommand;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Default)]
struct State {
    strings: HashMap<Vec<u8>, Vec<u8>>,
    hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>,
    lists: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    expiry: HashMap<Vec<u8>, Instant>,
    password: Option<String>,
    commands: Vec<String>,
    close_on: Option<(String, usize)>,
}

fn bulk(bytes: &[u8]) -> Value {
    Value::Bulk(bytes.to_vec())
}

fn arity() -> Value {
    Value::Error("ERR wrong number of arguments".to_string())
}

fn int_arg(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

impl State {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<Vec<u8>> = self
            .expiry
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn exists(&self, key: &[u8]) -> bool {
        self.strings.contains_key(key) || self.hashes.contains_key(key) || self.lists.contains_key(key)
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        self.expiry.remove(key);
        let s = self.strings.remove(key).is_some();
        let h = self.hashes.remove(key).is_some();
        let l = self.lists.remove(key).is_some();
        s || h || l
    }

    fn wrong_type_for_hash(&self, key: &[u8]) -> bool {
        self.strings.contains_key(key) || self.lists.contains_key(key)
    }

    fn wrong_type_for_list(&self, key: &[u8]) -> bool {
        self.strings.contains_key(key) || self.hashes.contains_key(key)
    }

    /// Whether `args` is a command armed with `close_on`.
    fn trips(&mut self, args: &[Vec<u8>]) -> bool {
        let Some(name) = args.first().map(|n| String::from_utf8_lossy(n).to_uppercase()) else {
            return false;
        };
        let Some((armed, left)) = self.close_on.as_mut() else {
            return false;
        };
        if *armed != name {
            return false;
        }
        *left -= 1;
        if *left == 0 {
            self.close_on = None;
        }
        self.commands.push(name);
        true
    }

    fn apply(&mut self, args: Vec<Vec<u8>>) -> Value {
        self.purge_expired();
        let Some((name, args)) = args.split_first() else {
            return Value::Error("ERR empty command".to_string());
        };
        let name = String::from_utf8_lossy(name).to_uppercase();
        self.commands.push(name.clone());

        match (name.as_str(), args) {
            ("PING", _) => Value::Status("PONG".to_string()),
            ("SELECT", [_]) => Value::Okay,
            ("AUTH", [pwd]) => match &self.password {
                Some(expected) if expected.as_bytes() == pwd.as_slice() => Value::Okay,
                Some(_) => Value::Error("WRONGPASS invalid password".to_string()),
                None => Value::Error("ERR Client sent AUTH, but no password is set".to_string()),
            },
            ("GET", [key]) => {
                if self.hashes.contains_key(key) || self.lists.contains_key(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                self.strings.get(key).map(|v| bulk(v)).unwrap_or(Value::Nil)
            }
            ("SET", [key, value]) => {
                self.remove(key);
                self.strings.insert(key.clone(), value.clone());
                Value::Okay
            }
            ("DEL", keys) if !keys.is_empty() => {
                Value::Int(keys.iter().filter(|k| self.remove(k)).count() as i64)
            }
            ("INCR", [key]) => {
                let current = match self.strings.get(key) {
                    Some(raw) => match int_arg(raw) {
                        Some(n) => n,
                        None => return Value::Error("ERR value is not an integer".to_string()),
                    },
                    None => 0,
                };
                self.strings.insert(key.clone(), (current + 1).to_string().into_bytes());
                Value::Int(current + 1)
            }
            ("EXPIRE", [key, secs]) => {
                let Some(secs) = int_arg(secs) else {
                    return Value::Error("ERR value is not an integer".to_string());
                };
                if !self.exists(key) {
                    return Value::Int(0);
                }
                self.expiry
                    .insert(key.clone(), Instant::now() + Duration::from_secs(secs.max(0) as u64));
                Value::Int(1)
            }
            ("TTL", [key]) => {
                if !self.exists(key) {
                    return Value::Int(-2);
                }
                match self.expiry.get(key) {
                    Some(at) => Value::Int(at.saturating_duration_since(Instant::now()).as_secs() as i64),
                    None => Value::Int(-1),
                }
            }
            ("HSET", [key, field, value]) | ("HSETNX", [key, field, value]) => {
                if self.wrong_type_for_hash(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                let hash = self.hashes.entry(key.clone()).or_default();
                let exists = hash.contains_key(field);
                if name == "HSETNX" && exists {
                    return Value::Int(0);
                }
                hash.insert(field.clone(), value.clone());
                Value::Int(if exists { 0 } else { 1 })
            }
            ("HMSET", [key, rest @ ..]) if !rest.is_empty() && rest.len() % 2 == 0 => {
                if self.wrong_type_for_hash(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                let hash = self.hashes.entry(key.clone()).or_default();
                for pair in rest.chunks(2) {
                    hash.insert(pair[0].clone(), pair[1].clone());
                }
                Value::Okay
            }
            ("HGET", [key, field]) => {
                if self.wrong_type_for_hash(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                self.hashes
                    .get(key)
                    .and_then(|h| h.get(field))
                    .map(|v| bulk(v))
                    .unwrap_or(Value::Nil)
            }
            ("HGETALL", [key]) => {
                if self.wrong_type_for_hash(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                let items = self
                    .hashes
                    .get(key)
                    .map(|h| h.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect())
                    .unwrap_or_default();
                Value::Array(items)
            }
            ("HDEL", [key, fields @ ..]) if !fields.is_empty() => {
                if self.wrong_type_for_hash(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                let Some(hash) = self.hashes.get_mut(key) else {
                    return Value::Int(0);
                };
                let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
                if hash.is_empty() {
                    self.remove(key);
                }
                Value::Int(removed as i64)
            }
            ("HINCRBY", [key, field, by]) => {
                if self.wrong_type_for_hash(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                let Some(by) = int_arg(by) else {
                    return Value::Error("ERR value is not an integer or out of range".to_string());
                };
                let hash = self.hashes.entry(key.clone()).or_default();
                let current = match hash.get(field) {
                    Some(raw) => match int_arg(raw) {
                        Some(n) => n,
                        None => return Value::Error("ERR hash value is not an integer".to_string()),
                    },
                    None => 0,
                };
                hash.insert(field.clone(), (current + by).to_string().into_bytes());
                Value::Int(current + by)
            }
            ("LPUSH", [key, values @ ..]) | ("RPUSH", [key, values @ ..]) if !values.is_empty() => {
                if self.wrong_type_for_list(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                let list = self.lists.entry(key.clone()).or_default();
                for value in values {
                    if name == "LPUSH" {
                        list.push_front(value.clone());
                    } else {
                        list.push_back(value.clone());
                    }
                }
                Value::Int(list.len() as i64)
            }
            ("RPOP", [key]) | ("LPOP", [key]) => {
                if self.wrong_type_for_list(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                let Some(list) = self.lists.get_mut(key) else {
                    return Value::Nil;
                };
                let item = if name == "RPOP" { list.pop_back() } else { list.pop_front() };
                if list.is_empty() {
                    self.remove(key);
                }
                item.map(|v| Value::Bulk(v)).unwrap_or(Value::Nil)
            }
            ("LLEN", [key]) => {
                if self.wrong_type_for_list(key) {
                    return Value::Error(WRONGTYPE.to_string());
                }
                Value::Int(self.lists.get(key).map_or(0, |l| l.len() as i64))
            }
            ("LRANGE", [key, start, stop]) => {
                let (Some(start), Some(stop)) = (int_arg(start), int_arg(stop)) else {
                    return Value::Error("ERR value is not an integer".to_string());
                };
                let Some(list) = self.lists.get(key) else {
                    return Value::Array(Vec::new());
                };
                let len = list.len() as i64;
                let start = if start < 0 { (len + start).max(0) } else { start };
                let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
                if start > stop {
                    return Value::Array(Vec::new());
                }
                Value::Array(
                    list.iter()
                        .skip(start as usize)
                        .take((stop - start + 1) as usize)
                        .map(|v| bulk(v))
                        .collect(),
                )
            }
            (
                "GET" | "SET" | "INCR" | "EXPIRE" | "TTL" | "HSET" | "HSETNX" | "HMSET" | "HGET" | "HGETALL" | "HDEL"
                | "HINCRBY" | "LPUSH" | "RPUSH" | "RPOP" | "LPOP" | "LLEN" | "LRANGE" | "DEL" | "SELECT" | "AUTH",
                _,
            ) => arity(),
            (other, _) => Value::Error(format!("ERR unknown command '{}'", other)),
        }
    }
}

/// An in-process store server on a random local port.
pub struct FakeStore {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    down: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl FakeStore {
    pub async fn start() -> Self {
        Self::start_with_password(None).await
    }

    pub async fn start_with_password(password: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State {
            password: password.map(str::to_string),
            ..State::default()
        }));
        let down = Arc::new(AtomicBool::new(false));

        let accept_state = Arc::clone(&state);
        let accept_down = Arc::clone(&down);
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                if accept_down.load(Ordering::SeqCst) {
                    drop(socket);
                    continue;
                }
                tokio::spawn(serve(socket, Arc::clone(&accept_state), Arc::clone(&accept_down)));
            }
        });

        Self {
            addr,
            state,
            down,
            handle,
        }
    }

    pub fn dsn(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::new(self.dsn()).with_io_timeout(Duration::from_secs(2))
    }

    pub fn client(&self) -> StoreClient {
        StoreClient::new(self.config())
    }

    /// A manager context on this store, with a fast connection retry.
    pub fn context(&self) -> Context {
        Context::new(self.client(), JobQueue::new())
            .with_host("test-host")
            .with_retry_delay(Duration::from_millis(10))
    }

    /// Makes the server drop every connection until `set_down(false)`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Elements of a list, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .lists
            .get(key.as_bytes())
            .map(|l| l.iter().map(|v| String::from_utf8_lossy(v).into_owned()).collect())
            .unwrap_or_default()
    }

    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        let mut state = self.state.lock().unwrap();
        state.purge_expired();
        state
            .hashes
            .get(key.as_bytes())
            .map(|h| {
                h.iter()
                    .map(|(f, v)| {
                        (
                            String::from_utf8_lossy(f).into_owned(),
                            String::from_utf8_lossy(v).into_owned(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_field(&self, key: &str, field: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .hashes
            .entry(key.as_bytes().to_vec())
            .or_default()
            .insert(field.as_bytes().to_vec(), value.as_bytes().to_vec());
    }

    /// Pushes onto the head of a list, like a producer's `LPUSH`.
    pub fn push(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .lists
            .entry(key.as_bytes().to_vec())
            .or_default()
            .push_front(value.as_bytes().to_vec());
    }

    /// Drops the connection, without running the command, on the next
    /// `times` commands named `name`. Later commands are served normally.
    pub fn close_on(&self, name: &str, times: usize) {
        self.state.lock().unwrap().close_on = Some((name.to_uppercase(), times));
    }

    /// Names of every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }
}

impl Drop for FakeStore {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut socket: TcpStream, state: Arc<Mutex<State>>, down: Arc<AtomicBool>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if down.load(Ordering::SeqCst) {
            return;
        }
        buffer.extend_from_slice(&chunk[..n]);

        let mut out = Vec::new();
        loop {
            match decode(&buffer) {
                Ok(Some((value, used))) => {
                    buffer.drain(..used);
                    let args = match value {
                        Value::Array(items) => items
                            .into_iter()
                            .map(|item| match item {
                                Value::Bulk(bytes) => bytes,
                                other => other.as_str().unwrap_or_default().as_bytes().to_vec(),
                            })
                            .collect(),
                        _ => Vec::new(),
                    };
                    let reply = {
                        let mut state = state.lock().unwrap();
                        if state.trips(&args) {
                            return;
                        }
                        state.apply(args)
                    };
                    encode_value(&mut out, &reply);
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        if !out.is_empty() && socket.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Worker command running the test build of `rjq worker`.
pub fn worker_command(job_type: &str, handler: &str) -> WorkerCommand {
    WorkerCommand::child(env!("CARGO_BIN_EXE_rjq"), job_type, handler)
}
