//! Telemetry for Kernel Forge.
//!
//! Structured logging via `tracing`, compile spans, and metrics through the
//! `metrics` facade. Nothing here opens network listeners.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{record_cache_lookup, record_compile, record_memory_pool, CacheOutcome};
pub use spans::{CompileSpan, SpanExt};
