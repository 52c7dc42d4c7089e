//! How a pool learns that its workers have something to say.
//!
//! Two strategies share one contract:
//!
//! - [`PollStrategy`] asks every worker on every pump; always correct
//! - [`ReadinessStrategy`] moves the output pipes into reader tasks that
//!   wake up on pipe readiness and forward lines over a channel, so a pump
//!   only touches workers that actually produced output
//!
//! The choice never changes what a pool does, only how often it looks.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::supervisor::Worker;
use crate::orchestrator::Context;

/// Scheduling strategy of a pool.
#[async_trait]
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Called once the worker's process is running.
    fn register(&mut self, worker: &mut Worker);

    /// Called when a worker leaves the pool.
    fn deregister(&mut self, worker_id: u64);

    /// Handles the available worker output without waiting for more.
    async fn pump(&mut self, workers: &mut [Worker], ctx: &mut Context);

    /// Whether a worker whose process exited may be removed now, or still
    /// has output on its way.
    fn may_reap(&self, _worker: &Worker) -> bool {
        true
    }
}

/// Selects a strategy in the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Poll,
    Readiness,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn Strategy> {
        match self {
            Self::Poll => Box::new(PollStrategy),
            Self::Readiness => Box::new(ReadinessStrategy::new()),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "poll" => Ok(Self::Poll),
            "readiness" => Ok(Self::Readiness),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Polls every worker on every pump.
#[derive(Debug, Default)]
pub struct PollStrategy;

#[async_trait]
impl Strategy for PollStrategy {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&mut self, _worker: &mut Worker) {}

    fn deregister(&mut self, _worker_id: u64) {}

    async fn pump(&mut self, workers: &mut [Worker], ctx: &mut Context) {
        for worker in workers.iter_mut() {
            worker.dispatch(ctx).await;
        }
    }
}

#[derive(Debug)]
enum Event {
    Line(String),
    Stderr(String),
    /// Stdout reached end of file; every line before it was forwarded.
    Closed,
}

/// Forwards worker output from reader tasks.
pub struct ReadinessStrategy {
    tx: mpsc::UnboundedSender<(u64, Event)>,
    rx: mpsc::UnboundedReceiver<(u64, Event)>,
    readers: HashMap<u64, Vec<JoinHandle<()>>>,
    closed: HashSet<u64>,
}

impl ReadinessStrategy {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            readers: HashMap::new(),
            closed: HashSet::new(),
        }
    }

    /// Number of workers with live reader tasks.
    pub fn registered(&self) -> usize {
        self.readers.len()
    }
}

impl Default for ReadinessStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for ReadinessStrategy {
    fn name(&self) -> &'static str {
        "readiness"
    }

    fn register(&mut self, worker: &mut Worker) {
        let id = worker.id();
        let Some((stdout, stderr)) = worker.take_output() else {
            warn!(worker_id = id, "Worker output already taken");
            return;
        };

        let tx = self.tx.clone();
        let mut handles = vec![tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((id, Event::Line(line))).is_err() {
                    return;
                }
            }
            let _ = tx.send((id, Event::Closed));
        })];

        if let Some(mut stderr) = stderr {
            let tx = self.tx.clone();
            handles.push(tokio::spawn(async move {
                let mut chunk = vec![0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                            if tx.send((id, Event::Stderr(text))).is_err() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        debug!(worker_id = id, "Worker registered for readiness");
        self.readers.insert(id, handles);
    }

    fn deregister(&mut self, worker_id: u64) {
        if let Some(handles) = self.readers.remove(&worker_id) {
            for handle in handles {
                handle.abort();
            }
        }
        self.closed.remove(&worker_id);
    }

    fn may_reap(&self, worker: &Worker) -> bool {
        !worker.is_busy() || self.closed.contains(&worker.id())
    }

    async fn pump(&mut self, workers: &mut [Worker], ctx: &mut Context) {
        while let Ok((id, event)) = self.rx.try_recv() {
            let Some(worker) = workers.iter_mut().find(|w| w.id() == id) else {
                continue;
            };
            match event {
                Event::Line(line) => worker.handle_reply(&line, ctx).await,
                Event::Stderr(text) => worker.log_diagnostics(&text),
                Event::Closed => {
                    self.closed.insert(id);
                }
            }
        }

        for worker in workers.iter_mut() {
            if !worker.has_process() || worker.is_alive() {
                continue;
            }
            // A busy worker may still have its reply in the channel.
            if !self.may_reap(worker) {
                continue;
            }
            warn!(
                worker_id = worker.id(),
                job_type = %worker.job_type(),
                status = ?worker.exit_status(),
                "Worker process exited"
            );
            worker.kill(ctx).await;
        }
    }
}
