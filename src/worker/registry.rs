//! Handler registry used inside the worker child.
//!
//! A job type maps to a statically typed function. The child resolves its
//! handler once at startup; the manager only ever sees the outcome.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context as _};
use serde_json::Value;

/// A job body: receives the decoded argument list.
pub type Handler = fn(&[Value]) -> anyhow::Result<()>;

/// Name → handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The handlers shipped with rjq.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register("noop", noop)
            .register("echo", echo)
            .register("sleep", sleep)
            .register("fail", fail)
            .register("crash", crash);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Handler) -> &mut Self {
        self.handlers.insert(name.into().to_lowercase(), handler);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Handler> {
        self.handlers.get(&name.to_lowercase()).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

fn noop(_args: &[Value]) -> anyhow::Result<()> {
    Ok(())
}

/// Writes the arguments to stderr, where the manager logs them.
fn echo(args: &[Value]) -> anyhow::Result<()> {
    eprintln!("{}", serde_json::to_string(args)?);
    Ok(())
}

/// Sleeps for the number of seconds given as first argument.
fn sleep(args: &[Value]) -> anyhow::Result<()> {
    let seconds = args
        .first()
        .and_then(Value::as_f64)
        .context("sleep expects a number of seconds as first argument")?;
    if !(0.0..=86_400.0).contains(&seconds) {
        bail!("sleep duration {} out of range", seconds);
    }
    std::thread::sleep(Duration::from_secs_f64(seconds));
    Ok(())
}

fn fail(args: &[Value]) -> anyhow::Result<()> {
    bail!("job failed on purpose with {} argument(s)", args.len())
}

/// Exits without replying, like a worker killed mid-job.
fn crash(_args: &[Value]) -> anyhow::Result<()> {
    std::process::exit(3)
}
