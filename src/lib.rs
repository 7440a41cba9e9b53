//! Lightweight distributed tracing for request-scoped telemetry.
//!
//! `rumtrace` produces spans describing the operations an application
//! performs, stitches them into traces across process boundaries via the
//! `traceparent` header, and ships finished spans to a collector through a
//! pluggable exporter pipeline.
//!
//! ## Getting started
//!
//! ```no_run
//! use rumtrace::{Tracer, KeyValue};
//! use rumtrace::export::HttpSpanExporter;
//! use rumtrace::processor::BatchConfig;
//!
//! # fn main() -> Result<(), rumtrace::TraceError> {
//! let exporter = HttpSpanExporter::builder("http://localhost:4318/v1/traces").build()?;
//! let tracer = Tracer::builder()
//!     .with_service_name("checkout-frontend")
//!     .with_batch_exporter(exporter, BatchConfig::default())
//!     .build();
//!
//! let mut span = tracer.start("page_load");
//! span.set_attribute(KeyValue::new("page.url", "/checkout"))?;
//! span.end()?;
//!
//! tracer.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! * No ambient context: the [`Tracer`] is an explicit handle passed by
//!   dependency injection, and parents are passed explicitly when starting
//!   child spans.
//! * Span creation never performs I/O; export happens through a
//!   [`processor`], either inline ([`processor::SimpleSpanProcessor`]) or
//!   on a dedicated background thread
//!   ([`processor::BatchSpanProcessor`]).
//! * Telemetry must not break the application: export failures are logged
//!   through [`tracing`] and the affected spans are dropped, never retried
//!   into the caller's path.

#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod common;
pub mod config;
mod error;
pub mod export;
pub mod id_generator;
pub mod instrument;
pub mod processor;
pub mod propagation;
pub mod sampler;
mod span;
mod trace_context;
mod tracer;

pub use common::{Key, KeyValue, Value};
pub use error::{TraceError, TraceResult};
pub use span::{Event, Span, SpanData, Status};
pub use trace_context::{SpanContext, SpanId, TraceFlags, TraceId};
pub use tracer::{SpanBuilder, Tracer, TracerBuilder};
