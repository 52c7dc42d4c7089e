//! Top-level dispatch loop.
//!
//! The [`Orchestrator`] owns one [`Pool`] per job type and the [`Context`]
//! they all share. Every tick it lets each pool dispatch once, then sleeps.
//! Statistics are flushed to a file and to the store at most once per flush
//! interval.
//!
//! # Shutdown
//!
//! - graceful: stop claiming, keep handling replies until every pool is
//!   empty (stuck workers are still killed and their job requeued)
//! - forced: report the jobs in flight, then kill every worker, which
//!   requeues them

pub mod context;
pub mod stats;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

pub use context::{local_hostname, Context};
pub use stats::{human_duration, resident_memory, Counters, Stats};

use crate::config::ManagerConfig;
use crate::error::WorkerError;
use crate::pool::Pool;
use crate::queue::{keys, unix_now, JobQueue};
use crate::shutdown::Shutdown;
use crate::store::StoreClient;
use crate::worker::WorkerCommand;

/// Runs the pools of a manager.
pub struct Orchestrator {
    ctx: Context,
    pools: Vec<Pool>,
    tick_interval: Duration,
    flush_interval: Duration,
    stats_path: Option<PathBuf>,
    last_flush: Option<Instant>,
}

impl Orchestrator {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            pools: Vec::new(),
            tick_interval: Duration::from_millis(10),
            flush_interval: Duration::from_secs(10),
            stats_path: None,
            last_flush: None,
        }
    }

    /// Builds the orchestrator and its pools from a manager configuration.
    pub fn from_config(config: &ManagerConfig, shutdown: Shutdown) -> Result<Self, WorkerError> {
        let store = StoreClient::new(config.server.clone());
        let queue = JobQueue::new().with_retention(config.retention());
        let ctx = Context::new(store, queue).with_shutdown(shutdown);

        let mut orchestrator = Self::new(ctx)
            .with_tick(config.tick())
            .with_flush_interval(config.flush_interval());
        if let Some(path) = &config.stats {
            orchestrator = orchestrator.with_stats_path(path.clone());
        }

        for (name, queue) in &config.queues {
            let pool_config = queue.pool_config(name);
            let command = match &config.worker_program {
                Some(program) => WorkerCommand::child(program.clone(), &pool_config.job_type, &pool_config.handler),
                None => WorkerCommand::current_exe(&pool_config.job_type, &pool_config.handler)?,
            };
            orchestrator = orchestrator.with_pool(Pool::new(pool_config, command, config.strategy.build()));
        }
        Ok(orchestrator)
    }

    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_path = Some(path.into());
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn stats(&self) -> &Stats {
        &self.ctx.stats
    }

    pub fn shutdown(&self) -> Shutdown {
        self.ctx.shutdown.clone()
    }

    /// Runs the dispatch loop until a stop is requested, then shuts down.
    pub async fn start(&mut self) {
        self.ctx.stats.start = unix_now();
        info!(
            host = %self.ctx.host,
            pools = self.pools.len(),
            queues = ?self.pools.iter().map(Pool::job_type).collect::<Vec<_>>(),
            "Job manager started"
        );

        while self.ctx.shutdown.is_running() {
            self.tick().await;
            self.wait(self.tick_interval).await;
        }

        if self.ctx.shutdown.is_forced() {
            self.stop();
        } else {
            self.drain().await;
        }
        self.teardown().await;
        self.flush().await;
        info!(
            done = self.ctx.stats.counters.done,
            fail = self.ctx.stats.counters.fail,
            errors = self.ctx.stats.counters.errors,
            "Job manager stopped"
        );
    }

    /// One pass over every pool. A failing pool never stops the others.
    pub async fn tick(&mut self) {
        for pool in self.pools.iter_mut() {
            if let Err(e) = pool.dispatch(&mut self.ctx).await {
                self.ctx.stats.counters.errors += 1;
                error!(job_type = %pool.job_type(), error = %e, "Dispatch failed");
            }
        }
    }

    /// Sleeps, then flushes statistics when the flush interval elapsed.
    pub async fn wait(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
        let due = self
            .last_flush
            .map_or(true, |last| last.elapsed() >= self.flush_interval);
        if due {
            self.flush().await;
        }
    }

    /// Writes the statistics snapshot to the stats file and the store.
    pub async fn flush(&mut self) {
        self.last_flush = Some(Instant::now());
        self.ctx.stats.memory = resident_memory();

        if let Some(path) = &self.stats_path {
            match serde_json::to_vec(&self.ctx.stats) {
                Ok(json) => {
                    if let Err(e) = tokio::fs::write(path, json).await {
                        warn!(path = %path.display(), error = %e, "Unable to write stats file");
                    }
                }
                Err(e) => warn!(error = %e, "Unable to serialize stats"),
            }
        }

        let fields = self.ctx.stats.store_fields();
        let key = keys::stats(&self.ctx.host);
        match self.ctx.store.hmset(&key, fields).read().await {
            Ok(_) => debug!(key = %key, "Stats flushed"),
            Err(e) => warn!(error = %e, "Fail to flush stats on the store"),
        }
    }

    /// Graceful stop: keeps handling replies until every pool is empty.
    ///
    /// A forced stop during the drain ends it early.
    pub async fn drain(&mut self) {
        let busy: usize = self.pools.iter().map(Pool::busy_count).sum();
        info!(busy = busy, "Waiting for running jobs to finish");
        loop {
            if self.ctx.shutdown.is_forced() {
                self.stop();
                return;
            }
            let mut empty = true;
            for pool in self.pools.iter_mut() {
                if !pool.drain(&mut self.ctx).await {
                    empty = false;
                }
            }
            if empty {
                return;
            }
            self.wait(self.tick_interval).await;
        }
    }

    /// Forced stop: reports every job still in flight. Returns their count.
    ///
    /// The workers are killed (and the jobs requeued) by [`teardown`](Self::teardown).
    pub fn stop(&self) -> usize {
        let mut count = 0;
        for pool in &self.pools {
            for (worker_id, job_id) in pool.in_flight() {
                warn!(
                    job_type = %pool.job_type(),
                    worker_id = worker_id,
                    job_id = %job_id,
                    "Forced stop with job in flight"
                );
                count += 1;
            }
        }
        if count > 0 {
            warn!(jobs = count, "Forced stop interrupts running jobs, they will be requeued");
        }
        count
    }

    /// Kills whatever workers remain.
    pub async fn teardown(&mut self) {
        for pool in self.pools.iter_mut() {
            pool.teardown(&mut self.ctx).await;
        }
    }
}
