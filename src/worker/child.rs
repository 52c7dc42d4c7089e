//! The worker child process (`rjq worker`).
//!
//! Reads job frames from stdin, runs the configured handler and answers one
//! `done`/`error` line per job on stdout. Anything written to stderr ends up
//! in the manager's log. The child is strictly sequential, so it uses
//! blocking std IO.

use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};

use anyhow::Context as _;

use super::frame::{FrameReader, WorkerReply, STOP};
use super::registry::{Handler, HandlerRegistry};

/// Stdin closed, or a `stop` frame was received.
pub const EXIT_OK: i32 = 0;
/// Malformed frame or broken pipe.
pub const EXIT_PROTOCOL: i32 = 1;
/// The requested handler does not exist.
pub const EXIT_UNKNOWN_HANDLER: i32 = 2;

/// Entry point of the child; returns the process exit code.
pub fn run_worker_main(job_type: &str, handler_name: &str) -> i32 {
    let registry = HandlerRegistry::builtin();
    let Some(handler) = registry.resolve(handler_name) else {
        eprintln!(
            "Unknown handler '{}' for job type '{}' (available: {})",
            handler_name,
            job_type,
            registry.names().collect::<Vec<_>>().join(", ")
        );
        return EXIT_UNKNOWN_HANDLER;
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let stderr = io::stderr();
    match serve(job_type, handler, stdin.lock(), stdout.lock(), stderr.lock()) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("Worker for '{}' stopped: {}", job_type, e);
            EXIT_PROTOCOL
        }
    }
}

/// Serves jobs until end of input or a `stop` frame.
pub fn serve<R, W, E>(job_type: &str, handler: Handler, input: R, mut output: W, mut diag: E) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    E: Write,
{
    let mut reader = FrameReader::new(input);
    loop {
        let Some(id) = reader.read_frame()? else {
            return Ok(());
        };
        let id = String::from_utf8_lossy(&id).into_owned();
        if id == STOP {
            return Ok(());
        }
        let Some(args) = reader.read_frame()? else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("missing arguments frame for job {}", id),
            ));
        };

        let reply = match run_job(handler, &args) {
            Ok(()) => WorkerReply::Done,
            Err(e) => {
                writeln!(diag, "Job {} ({}) failed: {:#}", id, job_type, e)?;
                diag.flush()?;
                WorkerReply::Error
            }
        };
        output.write_all(reply.as_line().as_bytes())?;
        output.flush()?;
    }
}

fn run_job(handler: Handler, raw_args: &[u8]) -> anyhow::Result<()> {
    let args: Vec<serde_json::Value> = serde_json::from_slice(raw_args).context("invalid job arguments")?;
    match panic::catch_unwind(AssertUnwindSafe(|| handler(&args))) {
        Ok(result) => result,
        Err(_) => anyhow::bail!("handler panicked"),
    }
}
