//! Error types for rjq operations.
//!
//! Defines error types for the major subsystems:
//! - Store client (connection, socket IO, protocol, server replies)
//! - Queue protocol (job records and their serialization)
//! - Worker supervision (spawn and pipe failures)
//! - Manager configuration

use thiserror::Error;

/// Errors raised by the store client.
///
/// The split mirrors what a caller can do about them: `Connection` and `Io`
/// are worth a reconnect-and-retry, the others are not.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store IO error: {0}")]
    Io(String),

    #[error("Store protocol error: {0}")]
    Protocol(String),

    #[error("Store replied with error: {0}")]
    Server(String),

    #[error("No pending command to read a reply for")]
    NothingPending,
}

impl StoreError {
    /// Returns true when reconnecting and retrying the operation makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_))
    }
}

/// Errors raised by the queue protocol.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid job record for '{id}': {reason}")]
    InvalidRecord { id: String, reason: String },
}

impl QueueError {
    /// True when the store connection failed and the call may succeed after
    /// reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_retryable())
    }
}

/// Errors raised while supervising a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Unable to start worker process '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Worker pipe error: {0}")]
    Pipe(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),
}

/// Errors raised while loading the manager configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read the configuration '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON syntax error in '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
