//! Supervision of one worker process.
//!
//! A [`Worker`] owns a child process and its three pipes. It writes job
//! frames to the child's stdin, reads `done`/`error` lines from its stdout and
//! relays whatever the child prints on stderr to the log.
//!
//! # Lifecycle
//!
//! ```text
//! unstarted ──get_process──► idle ──process──► busy ──done/error──► idle
//!                             │                 │
//!                             └──── kill ───────┴──► dead
//! ```
//!
//! A worker is busy exactly while it owns a claimed job. Killing a busy
//! worker puts its job back on the queue.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, trace, warn};

use super::frame::{encode_frame, WorkerReply, STOP};
use crate::error::{QueueError, WorkerError};
use crate::orchestrator::Context;
use crate::queue::ClaimedJob;

/// How long a stopping child gets to exit on its own.
const STOP_GRACE: Duration = Duration::from_millis(200);
/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// The command line a pool spawns its workers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `<program> worker --job-type <job_type> --handler <handler>`
    pub fn child(program: impl Into<PathBuf>, job_type: &str, handler: &str) -> Self {
        Self::new(program)
            .arg("worker")
            .arg("--job-type")
            .arg(job_type)
            .arg("--handler")
            .arg(handler)
    }

    /// Runs the worker child of the current executable.
    pub fn current_exe(job_type: &str, handler: &str) -> Result<Self, WorkerError> {
        let program = std::env::current_exe().map_err(|e| WorkerError::Spawn {
            program: "<current executable>".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::child(program, job_type, handler))
    }
}

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unstarted,
    Idle,
    Busy,
    Dead,
}

#[derive(Debug)]
struct InFlight {
    id: String,
    started: Instant,
}

/// Result of a non-blocking attempt to read one line from the child.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Line(String),
    Pending,
    Closed,
}

/// One supervised worker process.
pub struct Worker {
    id: u64,
    job_type: String,
    command: Arc<WorkerCommand>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<ChildStderr>,
    /// Bytes of a line not yet terminated.
    line: Vec<u8>,
    busy: bool,
    current: Option<InFlight>,
    last_activity: Instant,
    exit_status: Option<ExitStatus>,
    dead: bool,
}

impl Worker {
    pub fn new(id: u64, job_type: impl Into<String>, command: Arc<WorkerCommand>) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            command,
            child: None,
            stdin: None,
            stdout: None,
            stderr: None,
            line: Vec::new(),
            busy: false,
            current: None,
            last_activity: Instant::now(),
            exit_status: None,
            dead: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn state(&self) -> WorkerState {
        if self.dead {
            WorkerState::Dead
        } else if self.child.is_none() {
            WorkerState::Unstarted
        } else if self.busy {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn has_process(&self) -> bool {
        self.child.is_some()
    }

    /// Id of the job in flight, if any.
    pub fn current_job_id(&self) -> Option<&str> {
        self.current.as_ref().map(|job| job.id.as_str())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Time spent on the job in flight.
    pub fn busy_for(&self, now: Instant) -> Option<Duration> {
        self.current
            .as_ref()
            .map(|job| now.saturating_duration_since(job.started))
    }

    /// Time since the last job was handed out or finished.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Returns the child process, spawning it on first use.
    ///
    /// A worker that has been killed never respawns.
    pub fn get_process(&mut self) -> Result<&mut Child, WorkerError> {
        if self.dead {
            return Err(WorkerError::Pipe(format!("worker {} is dead", self.id)));
        }
        if self.child.is_none() {
            self.spawn()?;
        }
        self.child
            .as_mut()
            .ok_or_else(|| WorkerError::Pipe(format!("worker {} has no process", self.id)))
    }

    fn spawn(&mut self) -> Result<(), WorkerError> {
        let mut std_command = std::process::Command::new(&self.command.program);
        std_command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.command.working_dir {
            std_command.current_dir(dir);
        }
        // Own process group: a terminal interrupt reaches the manager only,
        // which then drains its workers.
        std_command.process_group(0);
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| WorkerError::Spawn {
            program: self.command.program.display().to_string(),
            reason: e.to_string(),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(WorkerError::Pipe("child pipes are missing".to_string()));
        };

        info!(
            worker_id = self.id,
            job_type = %self.job_type,
            pid = child.id(),
            "Worker process started"
        );
        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout));
        self.stderr = Some(stderr);
        self.child = Some(child);
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Hands the output pipes over to a readiness driven reader.
    pub(crate) fn take_output(&mut self) -> Option<(ChildStdout, Option<ChildStderr>)> {
        let stdout = self.stdout.take()?.into_inner();
        Some((stdout, self.stderr.take()))
    }

    /// Writes one frame to the child; false when the pipe is unusable.
    pub async fn send(&mut self, payload: &[u8]) -> bool {
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };
        let frame = encode_frame(payload);
        let result = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "Unable to write to worker");
                false
            }
        }
    }

    /// Sends a claimed job to the child and marks the worker busy.
    ///
    /// Returns false when the job could not be handed over; the caller still
    /// owns the claim and must requeue it.
    pub async fn process(&mut self, job: &ClaimedJob, ctx: &mut Context) -> bool {
        if self.busy {
            warn!(worker_id = self.id, job_id = %job.id(), "Worker is already busy");
            return false;
        }
        if let Err(e) = self.get_process() {
            error!(worker_id = self.id, error = %e, "Worker is not starting");
            return false;
        }
        if !self.send(job.id().as_bytes()).await || !self.send(job.args().as_bytes()).await {
            // Part of a job may sit in the pipe, the child is out of step.
            self.terminate().await;
            return false;
        }

        let now = Instant::now();
        self.busy = true;
        self.last_activity = now;
        self.current = Some(InFlight {
            id: job.id().to_string(),
            started: now,
        });
        ctx.stats.counters.queue += 1;

        if let Err(e) = ctx
            .queue
            .mark_progress(&mut ctx.store, job.id(), &ctx.host, self.pid())
            .await
        {
            warn!(job_id = %job.id(), error = %e, "Unable to flag job as in progress");
        }
        debug!(worker_id = self.id, job_id = %job.id(), "Job sent to worker");
        true
    }

    /// Reads what the child produced: stderr is logged, one stdout line is
    /// handled.
    pub async fn on_readable(&mut self, ctx: &mut Context) {
        self.drain_stderr();
        match self.poll_line() {
            ReadOutcome::Line(line) => self.handle_reply(&line, ctx).await,
            ReadOutcome::Pending => {}
            ReadOutcome::Closed => trace!(worker_id = self.id, "Worker output closed"),
        }
    }

    /// Applies one line of child output.
    pub async fn handle_reply(&mut self, line: &str, ctx: &mut Context) {
        let reply = match WorkerReply::parse(line) {
            None | Some(WorkerReply::Wait) => return,
            Some(WorkerReply::Unknown(text)) => {
                warn!(
                    worker_id = self.id,
                    job_type = %self.job_type,
                    line = %text,
                    "Unexpected worker output (protocol violation)"
                );
                return;
            }
            Some(reply) => reply,
        };

        let Some(job) = self.current.take() else {
            warn!(worker_id = self.id, reply = ?reply, "Worker replied without a job in flight");
            return;
        };

        if reply == WorkerReply::Done {
            let duration = job.started.elapsed();
            match self.complete(&job.id, duration, ctx).await {
                Ok(()) => {
                    ctx.stats.counters.done += 1;
                    debug!(
                        job_id = %job.id,
                        duration_ms = duration.as_millis() as u64,
                        "Job done"
                    );
                }
                Err(e) => {
                    ctx.stats.counters.errors += 1;
                    error!(job_id = %job.id, error = %e, "Unable to flag job as done, requeueing");
                    self.requeue(&job.id, ctx).await;
                }
            }
        } else {
            info!(worker_id = self.id, job_id = %job.id, "Job failed, requeueing");
            self.requeue(&job.id, ctx).await;
        }

        self.busy = false;
        self.last_activity = Instant::now();
    }

    /// Poll driven supervision: reads the reply of a busy worker, then
    /// checks that the process is still alive.
    pub async fn dispatch(&mut self, ctx: &mut Context) {
        if self.busy {
            self.on_readable(ctx).await;
        } else {
            self.drain_stderr();
        }

        if self.child.is_some() && !self.is_alive() {
            if self.busy {
                // A reply written right before exiting.
                self.on_readable(ctx).await;
            }
            warn!(
                worker_id = self.id,
                job_type = %self.job_type,
                status = ?self.exit_status,
                "Worker process exited"
            );
            self.kill(ctx).await;
        }
    }

    /// Stops the process; a job in flight goes back on the queue.
    ///
    /// Safe to call more than once.
    pub async fn kill(&mut self, ctx: &mut Context) {
        if let Some(job) = self.current.take() {
            warn!(worker_id = self.id, job_id = %job.id, "Worker killed with a job in flight, requeueing");
            self.requeue(&job.id, ctx).await;
        }
        self.busy = false;
        self.terminate().await;
    }

    /// Asks an idle child to exit, then releases it.
    pub async fn close(&mut self, ctx: &mut Context) {
        if self.busy {
            self.kill(ctx).await;
            return;
        }
        if self.child.is_some() && !self.dead {
            self.send(STOP.as_bytes()).await;
            self.stdin = None;
            if let Some(child) = self.child.as_mut() {
                if let Ok(Ok(status)) = tokio::time::timeout(STOP_GRACE, child.wait()).await {
                    self.exit_status = Some(status);
                }
            }
        }
        self.terminate().await;
    }

    /// True while the child process runs.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "Unable to query worker status");
                false
            }
        }
    }

    /// Logs child diagnostics line by line.
    pub fn log_diagnostics(&self, text: &str) {
        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            warn!(worker_id = self.id, job_type = %self.job_type, "{}", line);
        }
    }

    /// Flags a job done, retrying once after a reconnect when the store
    /// connection was lost.
    async fn complete(&self, job_id: &str, duration: Duration, ctx: &mut Context) -> Result<(), QueueError> {
        match ctx.queue.complete(&mut ctx.store, &self.job_type, job_id, duration).await {
            Err(e) if e.is_retryable() => {
                warn!(job_id = %job_id, error = %e, "Store lost while flagging job as done, retrying");
                if !ctx.require_store().await {
                    return Err(e);
                }
                ctx.queue.complete(&mut ctx.store, &self.job_type, job_id, duration).await
            }
            other => other,
        }
    }

    async fn requeue(&mut self, job_id: &str, ctx: &mut Context) {
        match ctx.queue.fail(&mut ctx.store, &self.job_type, job_id).await {
            Ok(()) => ctx.stats.counters.fail += 1,
            Err(e) => {
                ctx.stats.counters.errors += 1;
                error!(
                    job_id = %job_id,
                    job_type = %self.job_type,
                    error = %e,
                    "Job was NOT requeued (possible loss of data)"
                );
            }
        }
    }

    /// Reads one line from stdout without waiting.
    ///
    /// Partial lines stay buffered until their newline arrives.
    pub(crate) fn poll_line(&mut self) -> ReadOutcome {
        let Some(stdout) = self.stdout.as_mut() else {
            return ReadOutcome::Closed;
        };
        match stdout.read_until(b'\n', &mut self.line).now_or_never() {
            None => ReadOutcome::Pending,
            Some(Ok(0)) => {
                self.stdout = None;
                if self.line.is_empty() {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::Line(self.take_line())
                }
            }
            Some(Ok(_)) => ReadOutcome::Line(self.take_line()),
            Some(Err(e)) => {
                warn!(worker_id = self.id, error = %e, "Unable to read worker output");
                self.stdout = None;
                ReadOutcome::Closed
            }
        }
    }

    fn take_line(&mut self) -> String {
        let raw = std::mem::take(&mut self.line);
        String::from_utf8_lossy(&raw).trim_end().to_string()
    }

    fn drain_stderr(&mut self) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };
        let mut collected = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut closed = false;
        loop {
            match stderr.read(&mut chunk).now_or_never() {
                Some(Ok(0)) | Some(Err(_)) => {
                    closed = true;
                    break;
                }
                Some(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
                None => break,
            }
        }
        if closed {
            self.stderr = None;
        }
        if !collected.is_empty() {
            self.log_diagnostics(&String::from_utf8_lossy(&collected));
        }
    }

    async fn terminate(&mut self) {
        self.drain_stderr();
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                trace!(worker_id = self.id, error = %e, "Worker already gone");
            }
            if let Ok(Ok(status)) = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                self.exit_status = Some(status);
            }
            debug!(worker_id = self.id, status = ?self.exit_status, "Worker process released");
        }
        self.dead = true;
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("current", &self.current_job_id())
            .finish()
    }
}
