//! Job state machine and queue protocol.
//!
//! This module provides the distributed queue built on the store client:
//!
//! - **JobQueue**: enqueue, claim, complete, fail and status operations
//! - **Producer**: the submission API used by job producers
//! - **JobRecord**: the stored job and its state machine
//!
//! # Job lifecycle
//!
//! ```text
//!   submit ──► new ──► (queue) ──claim──► progress ──► done ──► (expired: undef)
//!                          ▲                  │
//!                          └──── error ◄──────┘
//!                        (after try_count seconds of backoff)
//! ```
//!
//! # Reliability
//!
//! Delivery is at-least-once. Any failure between a successful claim and a
//! terminal state ends in [`JobQueue::fail`], which puts the id back at the
//! tail of the queue.

pub mod job;
pub mod keys;
pub mod producer;
pub mod protocol;

pub use job::{new_job_id, unix_now, ClaimedJob, JobRecord, JobState};
pub use producer::Producer;
pub use protocol::{JobQueue, DEFAULT_RETENTION};
