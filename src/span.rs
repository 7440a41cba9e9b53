//! # Span
//!
//! `Span`s represent a single operation within a trace. Each trace contains
//! a root span, which typically describes the end-to-end latency, and
//! optionally one or more sub-spans for its sub-operations.
//!
//! A span is owned by the single logical flow that created it and moves
//! through exactly two states, `Open -> Ended`. While open it accumulates
//! attributes, events and a status; on `end()` it is frozen and its data is
//! handed to the configured span processor. Mutating an ended span is an
//! instrumentation bug and fails fast with [`TraceError::AlreadyEnded`].
//! Spans that were not sampled accept all mutations as cheap no-ops.

use crate::common::KeyValue;
use crate::error::{TraceError, TraceResult};
use crate::trace_context::{SpanContext, SpanId};
use crate::tracer::Tracer;
use std::borrow::Cow;
use std::mem;
use std::time::SystemTime;

/// The status of a [`Span`] once it has ended.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Status {
    /// The default status.
    #[default]
    Unset,
    /// The operation has been validated to have completed successfully.
    Ok,
    /// The operation contains an error.
    Error {
        /// The description of the error
        description: Cow<'static, str>,
    },
}

impl Status {
    /// Create a new error status with a given description.
    pub fn error(description: impl Into<Cow<'static, str>>) -> Self {
        Status::Error {
            description: description.into(),
        }
    }
}

/// A timestamped annotation on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// The name of this event.
    pub name: Cow<'static, str>,
    /// The exact time the event occurred.
    pub timestamp: SystemTime,
    /// Additional attributes describing the event.
    pub attributes: Vec<KeyValue>,
}

impl Event {
    /// Create new `Event`
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) -> Self {
        Event {
            name: name.into(),
            timestamp,
            attributes,
        }
    }
}

/// Immutable record of an ended span, as handed to the export pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// The span's own context.
    pub span_context: SpanContext,
    /// Id of the span that caused this one, `SpanId::INVALID` for roots.
    pub parent_span_id: SpanId,
    /// Operation name.
    pub name: Cow<'static, str>,
    /// Start time of the operation.
    pub start_time: SystemTime,
    /// End time, set on the `Open -> Ended` transition.
    pub end_time: SystemTime,
    /// Span attributes. Keys are unique, last write wins.
    pub attributes: Vec<KeyValue>,
    /// Appended events in chronological order.
    pub events: Vec<Event>,
    /// Span status.
    pub status: Status,
}

impl SpanData {
    /// The id of the parent span, if this span has one.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        if self.parent_span_id == SpanId::INVALID {
            None
        } else {
            Some(self.parent_span_id)
        }
    }
}

#[derive(Debug)]
enum SpanState {
    /// Created unsampled, nothing is recorded.
    NotRecording,
    /// Recording; mutations apply to the carried data.
    Open(SpanData),
    /// Terminal.
    Ended,
}

/// Single operation within a trace.
#[derive(Debug)]
pub struct Span {
    span_context: SpanContext,
    state: SpanState,
    tracer: Tracer,
}

impl Span {
    pub(crate) fn new(span_context: SpanContext, data: Option<SpanData>, tracer: Tracer) -> Self {
        Span {
            span_context,
            state: match data {
                Some(data) => SpanState::Open(data),
                None => SpanState::NotRecording,
            },
            tracer,
        }
    }

    /// Returns the `SpanContext` for the given `Span`. Available in every
    /// state, including after the span has ended.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Returns true if this `Span` is recording information like events,
    /// attributes or status. False for unsampled spans and after `end`.
    pub fn is_recording(&self) -> bool {
        matches!(self.state, SpanState::Open(_))
    }

    /// Sets a single attribute. Keys are unique within a span; setting an
    /// existing key replaces its value.
    pub fn set_attribute(&mut self, attribute: KeyValue) -> TraceResult<()> {
        self.with_data(|data| {
            match data
                .attributes
                .iter_mut()
                .find(|kv| kv.key == attribute.key)
            {
                Some(existing) => existing.value = attribute.value,
                None => data.attributes.push(attribute),
            }
        })
    }

    /// Records an event at the current time.
    pub fn add_event(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        attributes: Vec<KeyValue>,
    ) -> TraceResult<()> {
        self.add_event_with_timestamp(name, SystemTime::now(), attributes)
    }

    /// Records an event at a specific time.
    pub fn add_event_with_timestamp(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) -> TraceResult<()> {
        let name = name.into();
        self.with_data(|data| data.events.push(Event::new(name, timestamp, attributes)))
    }

    /// Records an error as an `exception` event on the span.
    pub fn record_exception(&mut self, err: &dyn std::error::Error) -> TraceResult<()> {
        let attributes = vec![KeyValue::new("exception.message", err.to_string())];
        self.add_event("exception", attributes)
    }

    /// Sets the status of this `Span`. Last write wins.
    pub fn set_status(&mut self, status: Status) -> TraceResult<()> {
        self.with_data(|data| data.status = status)
    }

    /// Finishes the `Span` at the current time, handing its data to the
    /// processor. A second call fails with [`TraceError::AlreadyEnded`] and
    /// leaves the recorded end time untouched.
    pub fn end(&mut self) -> TraceResult<()> {
        self.end_with_timestamp(SystemTime::now())
    }

    /// Finishes the `Span` with given timestamp.
    pub fn end_with_timestamp(&mut self, timestamp: SystemTime) -> TraceResult<()> {
        match mem::replace(&mut self.state, SpanState::Ended) {
            SpanState::Open(mut data) => {
                data.end_time = timestamp;
                self.tracer.on_span_end(data);
                Ok(())
            }
            SpanState::NotRecording => Ok(()),
            SpanState::Ended => Err(TraceError::AlreadyEnded),
        }
    }

    fn with_data<F>(&mut self, f: F) -> TraceResult<()>
    where
        F: FnOnce(&mut SpanData),
    {
        match &mut self.state {
            SpanState::Open(data) => {
                f(data);
                Ok(())
            }
            SpanState::NotRecording => Ok(()),
            SpanState::Ended => Err(TraceError::AlreadyEnded),
        }
    }

    /// Returns a clone of the internal span data for testing purposes.
    #[cfg(test)]
    pub(crate) fn data(&self) -> Option<SpanData> {
        match &self.state {
            SpanState::Open(data) => Some(data.clone()),
            _ => None,
        }
    }
}

impl Drop for Span {
    /// Implicitly end and report a span that is still open when dropped, so
    /// instrumented code that early-returns does not lose telemetry. Unlike
    /// an explicit double `end()`, dropping an ended span is not an error.
    fn drop(&mut self) {
        if let SpanState::Open(mut data) = mem::replace(&mut self.state, SpanState::Ended) {
            data.end_time = SystemTime::now();
            self.tracer.on_span_end(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::InMemorySpanExporter;
    use crate::tracer::Tracer;
    use std::time::Duration;

    fn test_tracer() -> (Tracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let tracer = Tracer::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (tracer, exporter)
    }

    #[test]
    fn add_event() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        let attributes = vec![KeyValue::new("k", "v")];
        span.add_event("some_event", attributes.clone()).unwrap();
        let data = span.data().unwrap();
        let event = data.events.first().expect("no event");
        assert_eq!(event.name, "some_event");
        assert_eq!(event.attributes, attributes);
    }

    #[test]
    fn add_event_with_timestamp() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        let timestamp = SystemTime::now();
        span.add_event_with_timestamp("some_event", timestamp, vec![])
            .unwrap();
        let data = span.data().unwrap();
        assert_eq!(data.events[0].timestamp, timestamp);
    }

    #[test]
    fn record_exception() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        let err = std::io::Error::other("boom");
        span.record_exception(&err).unwrap();
        let data = span.data().unwrap();
        let event = data.events.first().expect("no event");
        assert_eq!(event.name, "exception");
        assert_eq!(
            event.attributes,
            vec![KeyValue::new("exception.message", err.to_string())]
        );
    }

    #[test]
    fn set_attribute_last_write_wins() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        span.set_attribute(KeyValue::new("k", "v1")).unwrap();
        span.set_attribute(KeyValue::new("k", "v2")).unwrap();
        span.set_attribute(KeyValue::new("other", 1_i64)).unwrap();
        let data = span.data().unwrap();
        assert_eq!(data.attributes.len(), 2);
        assert_eq!(data.attributes[0], KeyValue::new("k", "v2"));
    }

    #[test]
    fn set_status_last_write_wins() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        span.set_status(Status::Ok).unwrap();
        span.set_status(Status::error("boom")).unwrap();
        assert_eq!(span.data().unwrap().status, Status::error("boom"));
    }

    #[test]
    fn end_freezes_end_time() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("operation");
        let timestamp = SystemTime::now();
        span.end_with_timestamp(timestamp).unwrap();

        let later = timestamp.checked_add(Duration::from_secs(10)).unwrap();
        assert!(matches!(
            span.end_with_timestamp(later),
            Err(TraceError::AlreadyEnded)
        ));

        let finished = exporter.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].end_time, timestamp);
    }

    #[test]
    fn mutation_after_end_fails_fast() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        span.end().unwrap();
        assert!(matches!(
            span.add_event("late", vec![]),
            Err(TraceError::AlreadyEnded)
        ));
        assert!(matches!(
            span.set_attribute(KeyValue::new("k", "v")),
            Err(TraceError::AlreadyEnded)
        ));
        assert!(matches!(
            span.set_status(Status::Ok),
            Err(TraceError::AlreadyEnded)
        ));
        assert!(matches!(span.end(), Err(TraceError::AlreadyEnded)));
    }

    #[test]
    fn end_time_not_before_start_time() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("operation");
        span.end().unwrap();
        let finished = exporter.get_finished_spans().unwrap();
        assert!(finished[0].end_time >= finished[0].start_time);
    }

    #[test]
    fn span_context_available_after_end() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        let context = span.span_context().clone();
        span.end().unwrap();
        assert_eq!(span.span_context(), &context);
    }

    #[test]
    fn is_recording_lifecycle() {
        let (tracer, _) = test_tracer();
        let mut span = tracer.start("operation");
        assert!(span.is_recording());
        span.end().unwrap();
        assert!(!span.is_recording());
    }

    #[test]
    fn drop_exports_open_span() {
        let (tracer, exporter) = test_tracer();
        {
            let _span = tracer.start("dropped");
        }
        let finished = exporter.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, "dropped");
    }

    #[test]
    fn drop_after_end_exports_once() {
        let (tracer, exporter) = test_tracer();
        {
            let mut span = tracer.start("ended");
            span.end().unwrap();
        }
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
    }

    #[test]
    fn unsampled_span_mutations_are_noops() {
        let exporter = InMemorySpanExporter::default();
        let tracer = Tracer::builder()
            .with_sampler(crate::sampler::Sampler::AlwaysOff)
            .with_simple_exporter(exporter.clone())
            .build();
        let mut span = tracer.start("invisible");
        assert!(!span.is_recording());
        span.add_event("event", vec![]).unwrap();
        span.set_status(Status::Ok).unwrap();
        span.end().unwrap();
        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }
}
