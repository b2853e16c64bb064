//! Metrics emitted through the `metrics` facade.
//!
//! No recorder is installed here; embedding applications choose the exporter.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

/// Where an artifact lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    MemoryHit,
    DiskHit,
    Miss,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MemoryHit => "memory",
            Self::DiskHit => "disk",
            Self::Miss => "miss",
        }
    }
}

pub fn record_cache_lookup(outcome: CacheOutcome) {
    counter!("forge_artifact_lookups_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn record_compile(elapsed: Duration, success: bool) {
    let status = if success { "ok" } else { "error" };
    counter!("forge_compiles_total", "status" => status).increment(1);
    histogram!("forge_compile_seconds").record(elapsed.as_secs_f64());
}

pub fn record_memory_pool(reserved_bytes: usize, used_bytes: usize) {
    gauge!("forge_pool_reserved_bytes").set(reserved_bytes as f64);
    gauge!("forge_pool_used_bytes").set(used_bytes as f64);
}
