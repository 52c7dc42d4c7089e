//! Job records stored in the coordination store.
//!
//! Each job lives in one hash, `job.<id>`, which is the single source of
//! truth for its state:
//!
//! - `JobState`: the state machine (`new` → `progress` → `done` | `error`)
//! - `JobRecord`: the decoded hash
//! - `ClaimedJob`: a record whose id this manager holds in the pending set

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Hash field names of a job record.
pub mod fields {
    pub const STATE: &str = "state";
    pub const CREATED: &str = "created";
    pub const TIME: &str = "time";
    pub const ARGS: &str = "args";
    pub const TRY: &str = "try";
    pub const DURATION: &str = "duration";
    pub const HOST: &str = "host";
    pub const PID: &str = "pid";
}

/// State of a job.
///
/// `Undef` is never stored: it is what a lookup of an expired or unknown id
/// yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    New,
    Progress,
    Done,
    Error,
    Undef,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Progress => "progress",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Undef => "undef",
        }
    }

    /// Parses a stored state; anything unknown or empty is `Undef`.
    pub fn parse(s: &str) -> Self {
        match s {
            "new" => JobState::New,
            "progress" => JobState::Progress,
            "done" => JobState::Done,
            "error" => JobState::Error,
            _ => JobState::Undef,
        }
    }

    /// Returns whether a job in this state may be handed to a worker.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, JobState::New | JobState::Error)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates a fresh, collision resistant job id.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// A decoded `job.<id>` hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    /// When the producer created the job.
    pub created_at: i64,
    /// Timestamp of the last state change.
    pub updated_at: i64,
    /// JSON encoded argument list, opaque to the manager.
    pub args: String,
    pub try_count: u32,
    /// Seconds the last successful run took.
    pub duration: Option<f64>,
    pub assigned_host: Option<String>,
    pub assigned_pid: Option<u32>,
}

impl JobRecord {
    /// Builds a record from the field/value pairs of `HGETALL`.
    ///
    /// Returns `Ok(None)` for an empty hash, i.e. an unknown or expired job.
    pub fn from_pairs(id: &str, pairs: Vec<(String, String)>) -> Result<Option<Self>, QueueError> {
        if pairs.is_empty() {
            return Ok(None);
        }
        let mut record = JobRecord {
            id: id.to_string(),
            state: JobState::Undef,
            created_at: 0,
            updated_at: 0,
            args: "[]".to_string(),
            try_count: 0,
            duration: None,
            assigned_host: None,
            assigned_pid: None,
        };
        for (field, value) in pairs {
            match field.as_str() {
                fields::STATE => record.state = JobState::parse(&value),
                fields::CREATED => record.created_at = parse_field(id, &field, &value)?,
                fields::TIME => record.updated_at = parse_field(id, &field, &value)?,
                fields::ARGS => record.args = value,
                fields::TRY => record.try_count = parse_field(id, &field, &value)?,
                fields::DURATION => record.duration = Some(parse_field(id, &field, &value)?),
                fields::HOST => record.assigned_host = Some(value),
                fields::PID => record.assigned_pid = value.parse().ok(),
                _ => {}
            }
        }
        Ok(Some(record))
    }

    /// Earliest unix time at which a failed job may be claimed again.
    ///
    /// Backoff is linear: one second per failure so far, counted from the
    /// last failure.
    pub fn retry_at(&self) -> i64 {
        self.updated_at + i64::from(self.try_count)
    }

    /// Returns whether the job may be dispatched at `now`.
    pub fn is_eligible(&self, now: i64) -> bool {
        match self.state {
            JobState::New => true,
            JobState::Error => now >= self.retry_at(),
            _ => false,
        }
    }

    /// Decodes the argument list.
    pub fn decode_args(&self) -> Result<Vec<serde_json::Value>, QueueError> {
        Ok(serde_json::from_str(&self.args)?)
    }
}

fn parse_field<T: std::str::FromStr>(id: &str, field: &str, value: &str) -> Result<T, QueueError> {
    value.trim().parse().map_err(|_| QueueError::InvalidRecord {
        id: id.to_string(),
        reason: format!("field '{}' has invalid value '{}'", field, value),
    })
}

/// A job whose id this manager holds in its type's pending set.
///
/// Only [`JobQueue::claim`](super::JobQueue::claim) creates one, so holding
/// a `ClaimedJob` means the exclusive claim succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job_type: String,
    pub record: JobRecord,
}

impl ClaimedJob {
    pub(crate) fn new(job_type: impl Into<String>, record: JobRecord) -> Self {
        Self {
            job_type: job_type.into(),
            record,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn args(&self) -> &str {
        &self.record.args
    }
}
