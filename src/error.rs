//! Errors produced by the tracing pipeline.
//!
//! Telemetry failures are contained within this crate: exporters and
//! processors log and drop, they never bubble an error into the code path
//! that produced the spans. The variants below therefore surface either at
//! explicit pipeline calls (`force_flush`, `shutdown`) or as fail-fast
//! signals for instrumentation bugs (mutating an ended [`Span`]).
//!
//! [`Span`]: crate::Span

use std::time::Duration;
use thiserror::Error;

/// Errors returned by trace API and pipeline operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// A span was mutated or ended after it had already ended.
    ///
    /// This signals a bug in instrumentation code and is raised eagerly so
    /// the bug is visible at the call site instead of silently producing
    /// incomplete telemetry.
    #[error("span has already ended")]
    AlreadyEnded,

    /// The exporter could not deliver a batch to the collector.
    ///
    /// The batch is dropped; delivery is at-most-once by design.
    #[error("export failed: {0}")]
    ExportFailed(String),

    /// An export or flush did not complete within the allowed time.
    #[error("export timed out after {0:?}")]
    ExportTimedOut(Duration),

    /// The tracer or processor has been shut down.
    #[error("tracer already shut down")]
    AlreadyShutdown,

    /// Other errors propagated from pipeline internals.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for trace operation results.
pub type TraceResult<T> = Result<T, TraceError>;
