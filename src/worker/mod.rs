//! Worker processes: the manager side and the child side.
//!
//! - [`supervisor`]: one supervised child process (`Worker`)
//! - [`strategy`]: poll or readiness driven reading of worker output
//! - [`frame`]: the pipe protocol shared by both sides
//! - [`child`] and [`registry`]: what runs inside `rjq worker`

pub mod child;
pub mod frame;
pub mod registry;
pub mod strategy;
pub mod supervisor;

pub use child::run_worker_main;
pub use frame::{encode_frame, WorkerReply};
pub use registry::{Handler, HandlerRegistry};
pub use strategy::{PollStrategy, ReadinessStrategy, Strategy, StrategyKind};
pub use supervisor::{Worker, WorkerCommand, WorkerState};
