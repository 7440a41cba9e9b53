//! # Tracer
//!
//! The [`Tracer`] is the factory for [`Span`]s and the owner of the export
//! pipeline. It is the explicit handle that instrumented components receive
//! by dependency injection; there is no hidden process-global tracer.
//! Construction goes through [`TracerBuilder`], teardown through
//! [`Tracer::shutdown`], which performs a final bounded flush.
//!
//! Parenting is explicit: callers either pass a parent [`SpanContext`]
//! (their own active span's, or one decoded from an inbound request header)
//! to [`SpanBuilder::with_parent`], or get a fresh root trace. Starting a
//! span performs no I/O.

use crate::common::KeyValue;
use crate::config::Config;
use crate::error::{TraceError, TraceResult};
use crate::export::SpanExporter;
use crate::processor::{BatchConfig, BatchSpanProcessor, SimpleSpanProcessor, SpanProcessor};
use crate::sampler::{SamplingDecision, ShouldSample};
use crate::span::{Span, SpanData, Status};
use crate::trace_context::{SpanContext, SpanId, TraceFlags};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Entry point for span creation, cheaply cloneable.
///
/// All clones share the same configuration and pipeline; each component that
/// starts spans should be handed its own clone.
#[derive(Clone, Debug)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

#[derive(Debug)]
struct TracerInner {
    config: Config,
    processor: Option<Box<dyn SpanProcessor>>,
    is_shutdown: AtomicBool,
}

impl Tracer {
    /// Create a builder for a new tracer.
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// Start a new root span at the current time.
    pub fn start(&self, name: impl Into<Cow<'static, str>>) -> Span {
        self.build_span(SpanBuilder::from_name(name))
    }

    /// Create a span builder for fine-grained span configuration.
    pub fn span_builder(&self, name: impl Into<Cow<'static, str>>) -> SpanBuilder {
        SpanBuilder::from_name(name)
    }

    /// Service name attached to every exported span.
    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    /// Returns true once [`shutdown`](Tracer::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Relaxed)
    }

    /// Export any spans buffered in the pipeline.
    pub fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown() {
            return Err(TraceError::AlreadyShutdown);
        }
        match &self.inner.processor {
            Some(processor) => processor.force_flush(),
            None => Ok(()),
        }
    }

    /// Shut the pipeline down after attempting a final bounded flush.
    ///
    /// Spans ended after shutdown are silently dropped; spans still queued
    /// when the flush timeout elapses are discarded. Calling `shutdown` a
    /// second time returns [`TraceError::AlreadyShutdown`].
    pub fn shutdown(&self) -> TraceResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        match &self.inner.processor {
            Some(processor) => processor.shutdown(),
            None => Ok(()),
        }
    }

    pub(crate) fn build_span(&self, builder: SpanBuilder) -> Span {
        let config = &self.inner.config;
        let span_id = config.id_generator.new_span_id();

        let (trace_id, parent_span_id, sampled) = match &builder.parent {
            Some(parent) if parent.is_valid() => {
                (parent.trace_id(), parent.span_id(), parent.is_sampled())
            }
            _ => {
                let trace_id = config.id_generator.new_trace_id();
                let decision = config.sampler.should_sample(trace_id, &builder.name);
                (
                    trace_id,
                    SpanId::INVALID,
                    decision == SamplingDecision::RecordAndSample,
                )
            }
        };

        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::default().with_sampled(sampled),
            false,
        );

        if !sampled || self.is_shutdown() {
            return Span::new(span_context, None, self.clone());
        }

        let start_time = builder.start_time.unwrap_or_else(SystemTime::now);
        let mut attributes = Vec::new();
        for attribute in builder.attributes.unwrap_or_default() {
            match attributes
                .iter_mut()
                .find(|kv: &&mut KeyValue| kv.key == attribute.key)
            {
                Some(existing) => existing.value = attribute.value,
                None => attributes.push(attribute),
            }
        }

        let data = SpanData {
            span_context: span_context.clone(),
            parent_span_id,
            name: builder.name,
            start_time,
            end_time: start_time,
            attributes,
            events: Vec::new(),
            status: Status::Unset,
        };

        Span::new(span_context, Some(data), self.clone())
    }

    /// Receives the frozen data of an ended span and hands it to the
    /// processor. Called from `Span::end` and `Span::drop`.
    pub(crate) fn on_span_end(&self, data: SpanData) {
        if self.is_shutdown() {
            return;
        }
        if let Some(processor) = &self.inner.processor {
            processor.on_end(data);
        }
    }
}

/// Builder for [`Tracer`] instances.
#[derive(Debug, Default)]
pub struct TracerBuilder {
    config: Config,
    processor: Option<Box<dyn SpanProcessor>>,
}

impl TracerBuilder {
    /// Service name attached to every exported span.
    pub fn with_service_name(mut self, service_name: impl Into<Cow<'static, str>>) -> Self {
        self.config = self.config.with_service_name(service_name);
        self
    }

    /// The sampling policy consulted for root spans.
    pub fn with_sampler<T: ShouldSample + 'static>(mut self, sampler: T) -> Self {
        self.config = self.config.with_sampler(sampler);
        self
    }

    /// The id generator used for fresh trace and span ids.
    pub fn with_id_generator<T: crate::id_generator::IdGenerator + 'static>(
        mut self,
        id_generator: T,
    ) -> Self {
        self.config = self.config.with_id_generator(id_generator);
        self
    }

    /// Export every ended span synchronously on the ending thread.
    ///
    /// Adds exporter latency to the caller's critical path; intended for
    /// low-volume or debugging use.
    pub fn with_simple_exporter<E: SpanExporter + 'static>(mut self, exporter: E) -> Self {
        self.processor = Some(Box::new(SimpleSpanProcessor::new(Box::new(exporter))));
        self
    }

    /// Buffer ended spans and export them in batches from a background
    /// thread. The recommended pipeline for production-volume traffic.
    pub fn with_batch_exporter<E: SpanExporter + 'static>(
        mut self,
        exporter: E,
        config: BatchConfig,
    ) -> Self {
        self.processor = Some(Box::new(BatchSpanProcessor::new(exporter, config)));
        self
    }

    /// Use a custom span processor.
    pub fn with_span_processor<P: SpanProcessor + 'static>(mut self, processor: P) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    /// Build the configured tracer handle.
    pub fn build(self) -> Tracer {
        let TracerBuilder {
            config,
            mut processor,
        } = self;
        if let Some(processor) = processor.as_mut() {
            processor.set_service_name(&config.service_name);
        }
        Tracer {
            inner: Arc::new(TracerInner {
                config,
                processor,
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

/// `SpanBuilder` allows span attributes to be configured before the span
/// has started.
#[derive(Clone, Debug)]
pub struct SpanBuilder {
    /// The operation name.
    pub name: Cow<'static, str>,
    /// The parent context. When set, the new span inherits the parent's
    /// trace id and sampling decision; when unset a new trace is started.
    pub parent: Option<SpanContext>,
    /// Span attributes recorded at creation.
    pub attributes: Option<Vec<KeyValue>>,
    /// Span start time, defaulting to now.
    pub start_time: Option<SystemTime>,
}

impl SpanBuilder {
    /// Create a new span builder from an operation name.
    pub fn from_name(name: impl Into<Cow<'static, str>>) -> Self {
        SpanBuilder {
            name: name.into(),
            parent: None,
            attributes: None,
            start_time: None,
        }
    }

    /// Assign the parent context.
    pub fn with_parent(mut self, parent: SpanContext) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Assign attributes known before the span starts.
    pub fn with_attributes(mut self, attributes: Vec<KeyValue>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Assign an explicit start time.
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Start the span with the given tracer.
    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.build_span(self)
    }
}
