//! Key layout shared by producers and managers.

/// `job.<id>`: the job record hash.
pub fn job(id: &str) -> String {
    format!("job.{}", id)
}

/// `<type>.queue`: ids waiting for a worker, oldest at the right end.
pub fn queue(job_type: &str) -> String {
    format!("{}.queue", normalize_type(job_type))
}

/// `<type>.pending`: ids currently claimed by a worker.
pub fn pending(job_type: &str) -> String {
    format!("{}.pending", normalize_type(job_type))
}

/// `rjq.stats.<host>`: statistics pushed by the manager running on `host`.
pub fn stats(host: &str) -> String {
    format!("rjq.stats.{}", host)
}

/// Job type names are case-insensitive.
pub fn normalize_type(job_type: &str) -> String {
    job_type.trim().to_lowercase()
}
