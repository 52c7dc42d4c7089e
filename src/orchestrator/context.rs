//! State shared by the orchestrator, its pools and their workers.

use std::time::Duration;

use tracing::warn;

use super::stats::Stats;
use crate::queue::JobQueue;
use crate::shutdown::Shutdown;
use crate::store::StoreClient;

/// Owned by the orchestrator and lent (`&mut`) to each pool and worker in
/// turn, which is how they reach the store and the counters.
pub struct Context {
    pub store: StoreClient,
    pub queue: JobQueue,
    pub stats: Stats,
    /// Name written into the `host` field of running jobs.
    pub host: String,
    pub shutdown: Shutdown,
    retry_delay: Duration,
}

impl Context {
    pub fn new(store: StoreClient, queue: JobQueue) -> Self {
        Self {
            store,
            queue,
            stats: Stats::new(),
            host: local_hostname(),
            shutdown: Shutdown::new(),
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Delay between two connection attempts in [`require_store`](Self::require_store).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Waits until the store is reachable.
    ///
    /// Returns false when a stop is requested before a connection succeeds.
    pub async fn require_store(&mut self) -> bool {
        loop {
            match self.store.ensure_connected().await {
                Ok(()) => return true,
                Err(e) => {
                    self.stats.counters.errors += 1;
                    warn!(
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Store is unreachable"
                    );
                }
            }
            if !self.shutdown.is_running() {
                return false;
            }
            tokio::time::sleep(self.retry_delay).await;
            if !self.shutdown.is_running() {
                return false;
            }
        }
    }
}

/// Host name of this machine, `localhost` when it cannot be read.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
