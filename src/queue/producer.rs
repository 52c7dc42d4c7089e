//! Job submission API for producers.

use super::job::JobState;
use super::protocol::JobQueue;
use crate::error::QueueError;
use crate::store::{StoreClient, StoreConfig};

/// Submits jobs and queries their state. Owns its own store connection.
pub struct Producer {
    store: StoreClient,
    queue: JobQueue,
}

impl Producer {
    /// Creates a producer; the store connection opens on first use.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_client(StoreClient::new(config))
    }

    pub fn with_client(store: StoreClient) -> Self {
        Self {
            store,
            queue: JobQueue::new(),
        }
    }

    /// Submits a job of `job_type` and returns its id.
    pub async fn submit(&mut self, job_type: &str, args: Vec<serde_json::Value>) -> Result<String, QueueError> {
        self.queue.enqueue(&mut self.store, job_type, &args).await
    }

    /// Returns the state of a job; unknown or expired ids are `Undef`.
    pub async fn query_status(&mut self, id: &str) -> Result<JobState, QueueError> {
        self.queue.status(&mut self.store, id).await
    }

    /// Access to the underlying client, e.g. for diagnostics.
    pub fn store_mut(&mut self) -> &mut StoreClient {
        &mut self.store
    }
}
