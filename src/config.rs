//! Manager configuration.
//!
//! Loaded from a JSON file (`rjq.conf` by default):
//!
//! ```json
//! {
//!   "server": { "dsn": "tcp://127.0.0.1:6379", "db": 0 },
//!   "stats": "/var/log/rjq.stats",
//!   "queues": {
//!     "mail": { "handler": "echo", "limit": 4 }
//!   }
//! }
//! ```
//!
//! Every field but `queues` has a default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pool::{PoolConfig, DEFAULT_BUSY_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use crate::queue::{keys, DEFAULT_RETENTION};
use crate::store::StoreConfig;
use crate::worker::StrategyKind;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "rjq.conf";
/// Default location of the statistics snapshot.
pub const DEFAULT_STATS_PATH: &str = "/var/log/rjq.stats";

/// Settings of one queue (one pool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Handler run by the workers; the queue name when absent.
    pub handler: Option<String>,
    pub limit: usize,
    pub idle_timeout_secs: u64,
    pub busy_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            handler: None,
            limit: 4,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT.as_secs(),
        }
    }
}

impl QueueConfig {
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Pool settings for the queue named `name`.
    pub fn pool_config(&self, name: &str) -> PoolConfig {
        let config = PoolConfig::new(name)
            .with_limit(self.limit)
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_busy_timeout(Duration::from_secs(self.busy_timeout_secs));
        match &self.handler {
            Some(handler) => config.with_handler(handler.clone()),
            None => config,
        }
    }
}

/// Whole manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub server: StoreConfig,
    /// Where the statistics snapshot is written.
    pub stats: Option<PathBuf>,
    /// Log file; stderr when absent.
    pub log: Option<PathBuf>,
    pub strategy: StrategyKind,
    pub tick_ms: u64,
    pub flush_interval_secs: u64,
    /// How long finished job records are kept.
    pub retention_secs: u64,
    /// Executable spawned as worker child; the running executable when absent.
    pub worker_program: Option<PathBuf>,
    pub queues: BTreeMap<String, QueueConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server: StoreConfig::default(),
            stats: Some(PathBuf::from(DEFAULT_STATS_PATH)),
            log: None,
            strategy: StrategyKind::default(),
            tick_ms: 10,
            flush_interval_secs: 10,
            retention_secs: DEFAULT_RETENTION.as_secs(),
            worker_program: None,
            queues: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validated()
    }

    /// Normalizes queue names and checks limits.
    pub fn validated(self) -> Result<Self, ConfigError> {
        let mut queues = BTreeMap::new();
        for (name, queue) in self.queues {
            let normalized = keys::normalize_type(&name);
            if normalized.is_empty() {
                return Err(ConfigError::Invalid("empty queue name".to_string()));
            }
            if queue.limit == 0 {
                return Err(ConfigError::Invalid(format!("queue '{}' has limit 0", name)));
            }
            if queues.insert(normalized.clone(), queue).is_some() {
                return Err(ConfigError::Invalid(format!("queue '{}' is defined twice", normalized)));
            }
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be at least 1".to_string()));
        }
        Ok(Self { queues, ..self })
    }

    pub fn with_server(mut self, server: StoreConfig) -> Self {
        self.server = server;
        self
    }

    pub fn with_queue(mut self, name: &str, queue: QueueConfig) -> Self {
        self.queues.insert(keys::normalize_type(name), queue);
        self
    }

    pub fn with_stats(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats = Some(path.into());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
