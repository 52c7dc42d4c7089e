//! Command-line interface for rjq.
//!
//! Provides the manager, producer, statistics and worker child commands.

mod commands;

pub use commands::{
    default_log_level, open_log_file, parse_cli, parse_job_arg, run, run_with_cli, Cli, Commands,
};
