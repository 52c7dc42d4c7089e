//! rjq: a Redis-backed distributed job queue.
//!
//! Producers enqueue named jobs with JSON arguments; a manager process pulls
//! them from per-type queues and fans them out to bounded pools of
//! long-lived worker processes, tracking job state, retries and liveness.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use config::{ManagerConfig, QueueConfig};
pub use error::{ConfigError, QueueError, StoreError, WorkerError};
pub use orchestrator::{Context, Orchestrator, Stats};
pub use pool::{Pool, PoolConfig};
pub use queue::{JobQueue, JobState, Producer};
pub use shutdown::Shutdown;
pub use store::{StoreClient, StoreConfig};
