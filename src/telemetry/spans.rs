//! Span utilities for artifact compilation.

use tracing::{info_span, Span};

/// Extension trait for recording outcomes on spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for compile spans.
pub struct CompileSpan;

impl CompileSpan {
    /// Span for one module compile.
    ///
    /// `status`, `error.message`, `source` (memory, disk or compiler) and
    /// `latency_ms` are filled in as the lookup progresses.
    pub fn new(artifact: &str, kernels: usize) -> Span {
        info_span!(
            "artifact_compile",
            artifact = %artifact,
            kernels = kernels,
            source = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
