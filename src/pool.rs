//! Worker pool for one job type.
//!
//! A [`Pool`] owns every worker of its job type. Each dispatch it:
//!
//! 1. scans its workers, evicting dead, zombie, stuck and long idle ones
//! 2. picks an idle worker or spawns one while under `limit`
//! 3. claims at most one job and hands it to that worker
//! 4. pumps worker output through its scheduling strategy
//!
//! A full pool skips steps 2 and 3: the job stays queued until a worker
//! frees up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::orchestrator::Context;
use crate::queue::keys;
use crate::worker::{Strategy, Worker, WorkerCommand, WorkerState};

/// Default time an idle worker is kept around.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default time a worker may spend on one job before it is killed.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Queue name, lower case.
    pub job_type: String,
    /// Handler the worker child runs.
    pub handler: String,
    /// Maximum number of worker processes.
    pub limit: usize,
    pub idle_timeout: Duration,
    pub busy_timeout: Duration,
}

impl PoolConfig {
    pub fn new(job_type: &str) -> Self {
        let job_type = keys::normalize_type(job_type);
        Self {
            handler: job_type.clone(),
            job_type,
            limit: 4,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    /// Process gone, no job.
    Dead,
    /// Process gone while busy.
    Zombie,
    /// Busy past the busy timeout.
    Stuck,
    /// Idle past the idle timeout, or drained.
    Idle,
}

fn eviction(worker: &mut Worker, config: &PoolConfig, strategy: &dyn Strategy, now: Instant) -> Option<Eviction> {
    match worker.state() {
        WorkerState::Dead | WorkerState::Unstarted => Some(Eviction::Dead),
        WorkerState::Busy if !worker.is_alive() && strategy.may_reap(worker) => Some(Eviction::Zombie),
        WorkerState::Busy if worker.busy_for(now).is_some_and(|d| d > config.busy_timeout) => {
            Some(Eviction::Stuck)
        }
        WorkerState::Busy => None,
        WorkerState::Idle if !worker.is_alive() => Some(Eviction::Dead),
        WorkerState::Idle if worker.idle_for(now) > config.idle_timeout => Some(Eviction::Idle),
        WorkerState::Idle => None,
    }
}

/// The workers of one job type.
pub struct Pool {
    config: PoolConfig,
    command: Arc<WorkerCommand>,
    strategy: Box<dyn Strategy>,
    workers: Vec<Worker>,
    next_id: u64,
}

impl Pool {
    pub fn new(config: PoolConfig, command: WorkerCommand, strategy: Box<dyn Strategy>) -> Self {
        Self {
            config,
            command: Arc::new(command),
            strategy,
            workers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.config.job_type
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    /// `(worker id, job id)` of every job in flight.
    pub fn in_flight(&self) -> Vec<(u64, String)> {
        self.workers
            .iter()
            .filter_map(|w| w.current_job_id().map(|job| (w.id(), job.to_string())))
            .collect()
    }

    /// Returns the index of a worker ready for a job, or `None` when the
    /// pool is full and every worker is busy.
    pub async fn get_worker(&mut self, ctx: &mut Context) -> Option<usize> {
        // A reply written right before the child exited is handled before
        // the worker counts as a zombie.
        if self.workers.iter_mut().any(|w| w.is_busy() && !w.is_alive()) {
            self.pump(ctx).await;
        }

        let now = Instant::now();
        let mut i = 0;
        while i < self.workers.len() {
            match eviction(&mut self.workers[i], &self.config, self.strategy.as_ref(), now) {
                Some(reason) => {
                    let mut worker = self.workers.remove(i);
                    self.evict(&mut worker, reason, ctx).await;
                }
                None => i += 1,
            }
        }

        if let Some(index) = self.workers.iter().position(|w| w.state() == WorkerState::Idle) {
            return Some(index);
        }
        if self.workers.len() >= self.config.limit {
            return None;
        }
        self.spawn_worker(ctx)
    }

    fn spawn_worker(&mut self, ctx: &mut Context) -> Option<usize> {
        let id = self.next_id;
        self.next_id += 1;
        let mut worker = Worker::new(id, self.config.job_type.clone(), Arc::clone(&self.command));
        if let Err(e) = worker.get_process() {
            ctx.stats.counters.errors += 1;
            error!(job_type = %self.config.job_type, error = %e, "Unable to start worker");
            return None;
        }
        self.strategy.register(&mut worker);
        ctx.stats.counters.workers += 1;
        self.workers.push(worker);
        Some(self.workers.len() - 1)
    }

    async fn evict(&mut self, worker: &mut Worker, reason: Eviction, ctx: &mut Context) {
        self.strategy.deregister(worker.id());
        match reason {
            Eviction::Idle => {
                debug!(worker_id = worker.id(), job_type = %self.config.job_type, "Closing inactive worker");
                worker.close(ctx).await;
            }
            Eviction::Dead => {
                debug!(worker_id = worker.id(), status = ?worker.exit_status(), "Removing dead worker");
                worker.kill(ctx).await;
            }
            Eviction::Zombie => {
                warn!(
                    worker_id = worker.id(),
                    job_id = ?worker.current_job_id(),
                    status = ?worker.exit_status(),
                    "Worker died during a job"
                );
                worker.kill(ctx).await;
            }
            Eviction::Stuck => {
                warn!(
                    worker_id = worker.id(),
                    job_id = ?worker.current_job_id(),
                    busy_secs = worker.busy_for(Instant::now()).map(|d| d.as_secs()),
                    "Killing timed out worker"
                );
                worker.kill(ctx).await;
            }
        }
        ctx.stats.counters.workers = ctx.stats.counters.workers.saturating_sub(1);
    }

    /// One dispatch pass. Returns true when a job was claimed.
    ///
    /// Worker output is pumped whatever happens to the claim.
    pub async fn dispatch(&mut self, ctx: &mut Context) -> Result<bool, QueueError> {
        let claimed = match self.get_worker(ctx).await {
            Some(index) => self.dispatch_to(index, ctx).await,
            None => Ok(false),
        };
        self.pump(ctx).await;
        claimed
    }

    async fn dispatch_to(&mut self, index: usize, ctx: &mut Context) -> Result<bool, QueueError> {
        if !ctx.require_store().await {
            return Ok(false);
        }
        let Some(job) = ctx.queue.claim(&mut ctx.store, &self.config.job_type).await? else {
            return Ok(false);
        };
        debug!(job_id = %job.id(), job_type = %self.config.job_type, "Work on job");

        if !self.workers[index].process(&job, ctx).await {
            ctx.stats.counters.errors += 1;
            error!(
                job_id = %job.id(),
                job_type = %self.config.job_type,
                "Worker error: the worker is not starting (see logs)"
            );
            match ctx.queue.fail(&mut ctx.store, &self.config.job_type, job.id()).await {
                Ok(()) => ctx.stats.counters.fail += 1,
                Err(e) => {
                    ctx.stats.counters.errors += 1;
                    error!(job_id = %job.id(), error = %e, "Job was NOT requeued (possible loss of data)");
                }
            }
        }
        Ok(true)
    }

    /// Handles pending worker output.
    pub async fn pump(&mut self, ctx: &mut Context) {
        self.strategy.pump(&mut self.workers, ctx).await;
    }

    /// Drops every worker that is not busy and kills busy workers past the
    /// busy timeout. Returns true once the pool is empty.
    pub async fn clean(&mut self, ctx: &mut Context) -> bool {
        let now = Instant::now();
        let mut i = 0;
        while i < self.workers.len() {
            let reason = match eviction(&mut self.workers[i], &self.config, self.strategy.as_ref(), now) {
                Some(reason) => Some(reason),
                None if !self.workers[i].is_busy() => Some(Eviction::Idle),
                None => None,
            };
            match reason {
                Some(reason) => {
                    let mut worker = self.workers.remove(i);
                    self.evict(&mut worker, reason, ctx).await;
                }
                None => i += 1,
            }
        }
        self.workers.is_empty()
    }

    /// One step of a graceful drain: no claims, replies still handled.
    pub async fn drain(&mut self, ctx: &mut Context) -> bool {
        self.pump(ctx).await;
        self.clean(ctx).await
    }

    /// Kills every worker, requeueing the jobs in flight.
    pub async fn teardown(&mut self, ctx: &mut Context) {
        if self.workers.is_empty() {
            return;
        }
        info!(
            job_type = %self.config.job_type,
            workers = self.workers.len(),
            busy = self.busy_count(),
            "Tearing down workers"
        );
        for mut worker in std::mem::take(&mut self.workers) {
            self.strategy.deregister(worker.id());
            worker.kill(ctx).await;
            ctx.stats.counters.workers = ctx.stats.counters.workers.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("strategy", &self.strategy.name())
            .field("workers", &self.workers)
            .finish()
    }
}
