//! Process-wide statistics record.
//!
//! Observability only: nothing in the dispatch path reads these numbers back.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::queue::unix_now;

/// Monotonic counters. `workers` is the only gauge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Live worker processes.
    pub workers: u64,
    /// Jobs handed to a worker.
    pub queue: u64,
    pub done: u64,
    pub fail: u64,
    /// Store, spawn and dispatch errors.
    pub errors: u64,
}

/// The snapshot written to the stats file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Process start (unix seconds).
    pub init: i64,
    /// Start of the dispatch loop (unix seconds).
    pub start: i64,
    /// Resident memory in bytes at the last flush.
    pub memory: u64,
    pub counters: Counters,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            init: unix_now(),
            ..Self::default()
        }
    }

    /// Fields pushed under the per-host stats key.
    pub fn store_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", "run".to_string()),
            ("memory", self.memory.to_string()),
            ("nb.workers", self.counters.workers.to_string()),
            ("nb.queue", self.counters.queue.to_string()),
            ("nb.done", self.counters.done.to_string()),
            ("nb.fail", self.counters.fail.to_string()),
            ("nb.errors", self.counters.errors.to_string()),
        ]
    }

    /// Reads a snapshot written by a running manager.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Human readable report, as printed by `rjq stats`.
    pub fn report(&self, now: i64) -> String {
        let started = Local
            .timestamp_opt(self.start, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.start.to_string());

        let mut out = String::new();
        let _ = writeln!(out, "Started at {} - {}", started, human_duration(now - self.start));
        let _ = writeln!(out);
        let _ = writeln!(out, "Memory   : {:.2}MB", self.memory as f64 / 1024.0 / 1024.0);
        let _ = writeln!(out, "Workers  : {}", self.counters.workers);
        let _ = writeln!(out, "Queue    : {}", self.counters.queue);
        let _ = writeln!(
            out,
            "Jobs     : {} done, {} fails, {} errors",
            self.counters.done, self.counters.fail, self.counters.errors
        );
        out
    }
}

/// Formats a number of seconds as "1 hour, 2 minutes".
pub fn human_duration(secs: i64) -> String {
    const UNITS: [(&str, i64); 5] = [
        ("week", 7 * 24 * 3600),
        ("day", 24 * 3600),
        ("hour", 3600),
        ("minute", 60),
        ("second", 1),
    ];

    if secs <= 0 {
        return "0 seconds".to_string();
    }
    let mut rest = secs;
    let mut parts = Vec::new();
    for (name, size) in UNITS {
        let quot = rest / size;
        if quot > 0 {
            parts.push(format!("{} {}{}", quot, name, if quot > 1 { "s" } else { "" }));
            rest -= quot * size;
        }
    }
    parts.join(", ")
}

/// Resident set size of this process in bytes, 0 when unknown.
pub fn resident_memory() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|size| size as u64)
            .unwrap_or(4096);
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok()) {
                return pages * page_size;
            }
        }
    }
    0
}
