//! Queue operations expressed as store commands.
//!
//! # Layout
//!
//! - `job.<id>`: record hash (see [`JobRecord`])
//! - `<type>.queue`: list of waiting ids; producers `LPUSH`, managers `RPOP`,
//!   which gives FIFO order across all producers
//! - `<type>.pending`: hash of claimed ids; a claim is a successful `HSETNX`,
//!   so two managers can never both own the same id
//!
//! Every multi-step operation goes out as one pipelined batch. A manager
//! crash between two batches can still orphan a pending entry; the busy
//! timeout of the pool is what recovers the job in that case.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::job::{fields, new_job_id, unix_now, ClaimedJob, JobRecord, JobState};
use super::keys;
use crate::error::QueueError;
use crate::store::StoreClient;

/// Default time a finished job record is kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// The queue protocol. Holds no connection; every call borrows the shared
/// store client.
#[derive(Debug, Clone)]
pub struct JobQueue {
    retention: Duration,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
        }
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a completed job record survives.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Creates a job record in state `new` and pushes its id on the queue.
    pub async fn enqueue(
        &self,
        store: &mut StoreClient,
        job_type: &str,
        args: &[serde_json::Value],
    ) -> Result<String, QueueError> {
        let id = new_job_id();
        let now = unix_now();
        let args = serde_json::to_string(args)?;

        store
            .hmset(
                keys::job(&id),
                [
                    (fields::STATE, JobState::New.as_str().to_string()),
                    (fields::CREATED, now.to_string()),
                    (fields::TIME, now.to_string()),
                    (fields::ARGS, args),
                ],
            )
            .lpush(keys::queue(job_type), &id)
            .read()
            .await?;

        debug!(job_id = %id, job_type = %job_type, "Job enqueued");
        Ok(id)
    }

    /// Claims the next dispatchable job of `job_type`.
    ///
    /// Returns `Ok(None)` when the queue is empty or when the job at its head
    /// is still backing off after a failure (it is pushed back to the tail).
    pub async fn claim(
        &self,
        store: &mut StoreClient,
        job_type: &str,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let queue = keys::queue(job_type);
        let pending = keys::pending(job_type);

        loop {
            let Some(id) = store.rpop(&queue).read().await?.into_value().into_string() else {
                return Ok(None);
            };
            if id.is_empty() {
                continue;
            }
            let now = unix_now();

            let replies = match store
                .hsetnx(&pending, &id, now)
                .hgetall(keys::job(&id))
                .read()
                .await
            {
                Ok(reply) => reply.into_vec(),
                Err(e) => {
                    // The id is out of the queue already, put it back.
                    self.requeue_popped(store, job_type, &id).await;
                    return Err(e.into());
                }
            };
            let mut replies = replies.into_iter();
            let claimed = replies.next().and_then(|v| v.as_int()) == Some(1);
            let hash = replies.next().map(|v| v.into_pairs()).unwrap_or_default();

            if !claimed {
                warn!(job_id = %id, job_type = %job_type, "Job is already pending (zombie?), dropping duplicate");
                continue;
            }

            let record = match JobRecord::from_pairs(&id, hash) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    info!(job_id = %id, job_type = %job_type, "Job record is gone, dropping");
                    self.release(store, job_type, &id).await?;
                    continue;
                }
                Err(e) => {
                    error!(job_id = %id, job_type = %job_type, error = %e, "Job record is corrupt, dropping");
                    self.release(store, job_type, &id).await?;
                    continue;
                }
            };

            if !record.state.is_dispatchable() {
                info!(
                    job_id = %id,
                    job_type = %job_type,
                    state = %record.state,
                    "Job state is irrelevant for dispatch, dropping"
                );
                self.release(store, job_type, &id).await?;
                continue;
            }

            if !record.is_eligible(now) {
                debug!(
                    job_id = %id,
                    retry_at = record.retry_at(),
                    "Job is backing off, pushing it back"
                );
                if let Err(e) = store.hdel(&pending, &id).lpush(&queue, &id).read().await {
                    self.requeue_popped(store, job_type, &id).await;
                    return Err(e.into());
                }
                return Ok(None);
            }

            return Ok(Some(ClaimedJob::new(keys::normalize_type(job_type), record)));
        }
    }

    /// Reads a job record.
    pub async fn fetch(&self, store: &mut StoreClient, id: &str) -> Result<Option<JobRecord>, QueueError> {
        let pairs = store.hgetall(keys::job(id)).read().await?.into_value().into_pairs();
        JobRecord::from_pairs(id, pairs)
    }

    /// Flags a claimed job as running on `host` under `pid`.
    pub async fn mark_progress(
        &self,
        store: &mut StoreClient,
        id: &str,
        host: &str,
        pid: Option<u32>,
    ) -> Result<(), QueueError> {
        let mut values = vec![
            (fields::STATE, JobState::Progress.as_str().to_string()),
            (fields::TIME, unix_now().to_string()),
            (fields::HOST, host.to_string()),
        ];
        if let Some(pid) = pid {
            values.push((fields::PID, pid.to_string()));
        }
        store.hmset(keys::job(id), values).read().await?;
        Ok(())
    }

    /// Marks a job done and schedules its record for expiry.
    pub async fn complete(
        &self,
        store: &mut StoreClient,
        job_type: &str,
        id: &str,
        duration: Duration,
    ) -> Result<(), QueueError> {
        let key = keys::job(id);
        store
            .hdel(keys::pending(job_type), id)
            .hmset(
                &key,
                [
                    (fields::STATE, JobState::Done.as_str().to_string()),
                    (fields::TIME, unix_now().to_string()),
                    (fields::DURATION, format!("{:.3}", duration.as_secs_f64())),
                ],
            )
            .expire(&key, self.retention.as_secs().max(1))
            .read()
            .await?;
        Ok(())
    }

    /// Marks a job failed and pushes it back on the queue for a later retry.
    pub async fn fail(&self, store: &mut StoreClient, job_type: &str, id: &str) -> Result<(), QueueError> {
        let key = keys::job(id);
        store
            .hdel(keys::pending(job_type), id)
            .hincrby(&key, fields::TRY, 1)
            .hmset(
                &key,
                [
                    (fields::STATE, JobState::Error.as_str().to_string()),
                    (fields::TIME, unix_now().to_string()),
                ],
            )
            .lpush(keys::queue(job_type), id)
            .read()
            .await?;
        Ok(())
    }

    /// Reads the state of a job; an absent record is `Undef`.
    pub async fn status(&self, store: &mut StoreClient, id: &str) -> Result<JobState, QueueError> {
        let value = store.hget(keys::job(id), fields::STATE).read().await?.into_value();
        Ok(value
            .into_string()
            .map(|s| JobState::parse(&s))
            .unwrap_or(JobState::Undef))
    }

    /// Number of ids waiting in the queue of `job_type`.
    pub async fn queue_len(&self, store: &mut StoreClient, job_type: &str) -> Result<usize, QueueError> {
        let len = store.llen(keys::queue(job_type)).read().await?.into_value().as_int();
        Ok(len.unwrap_or(0).max(0) as usize)
    }

    /// Waiting ids, next to be claimed first.
    pub async fn queued_ids(&self, store: &mut StoreClient, job_type: &str) -> Result<Vec<String>, QueueError> {
        let value = store.lrange(keys::queue(job_type), 0, -1).read().await?.into_value();
        let mut ids: Vec<String> = match value {
            crate::store::Value::Array(items) => items.into_iter().filter_map(|v| v.into_string()).collect(),
            _ => Vec::new(),
        };
        ids.reverse();
        Ok(ids)
    }

    async fn release(&self, store: &mut StoreClient, job_type: &str, id: &str) -> Result<(), QueueError> {
        store.hdel(keys::pending(job_type), id).read().await?;
        Ok(())
    }

    async fn requeue_popped(&self, store: &mut StoreClient, job_type: &str, id: &str) {
        if let Err(e) = self.fail(store, job_type, id).await {
            error!(
                job_id = %id,
                job_type = %job_type,
                error = %e,
                "Job was NOT requeued (possible loss of data)"
            );
        }
    }
}
