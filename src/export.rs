//! # Span Exporters
//!
//! An exporter turns a batch of finished spans into whatever shape its sink
//! requires and ships it. Exporters never surface failures to the code that
//! produced the spans: a failed export is reported through the returned
//! [`ExportResult`] to the processor, which logs it and drops the batch.
//! Delivery is at-most-once by design.

use crate::error::{TraceError, TraceResult};
use crate::common::Value;
use crate::span::SpanData;
use crate::trace_context::SpanId;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Results of an export attempt.
pub type ExportResult = TraceResult<()>;

/// `SpanExporter` defines the interface that protocol-specific exporters
/// must implement so that they can be plugged into a processor pipeline.
pub trait SpanExporter: Send + Sync + Debug {
    /// Exports a batch of readable spans. Protocol exporters that will
    /// implement this function are typically expected to serialize and
    /// transmit the data to the destination.
    ///
    /// Any retry logic that is required by the exporter is the
    /// responsibility of the exporter.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. Called when the pipeline is shut down; this
    /// is an opportunity to release resources.
    fn shutdown(&mut self) {}

    /// Set the service name reported with exported spans.
    fn set_service_name(&mut self, _service_name: &str) {}
}

/// A [`SpanExporter`] that stores finished spans in memory, for assertions
/// in tests.
///
/// Clones share the same backing storage.
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
    service_name: Arc<Mutex<Option<String>>>,
}

impl InMemorySpanExporter {
    /// Returns the finished spans this exporter has received so far.
    pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanData>> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .map_err(|err| TraceError::Other(format!("cannot lock span storage: {err}")))
    }

    /// Clears the stored spans.
    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }

    /// The service name the pipeline handed to this exporter, if any.
    pub fn service_name(&self) -> Option<String> {
        self.service_name.lock().ok().and_then(|name| name.clone())
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .spans
            .lock()
            .map(|mut spans| spans.extend(batch))
            .map_err(|err| TraceError::Other(format!("cannot lock span storage: {err}")));
        Box::pin(futures_util::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.reset();
    }

    fn set_service_name(&mut self, service_name: &str) {
        if let Ok(mut name) = self.service_name.lock() {
            *name = Some(service_name.to_owned());
        }
    }
}

/// A [`SpanExporter`] that POSTs finished spans as a JSON batch to an HTTP
/// collector endpoint.
///
/// The request is performed with a blocking client and is expected to be
/// driven from the processor's dedicated thread (or, for the simple
/// processor, the thread that ended the span), never from inside an async
/// runtime.
#[derive(Debug)]
pub struct HttpSpanExporter {
    endpoint: String,
    client: reqwest::blocking::Client,
    service_name: String,
}

impl HttpSpanExporter {
    /// Create a builder targeting the given collector endpoint.
    pub fn builder(endpoint: impl Into<String>) -> HttpExporterBuilder {
        HttpExporterBuilder {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for [`HttpSpanExporter`].
#[derive(Debug)]
pub struct HttpExporterBuilder {
    endpoint: String,
    timeout: Duration,
}

impl HttpExporterBuilder {
    /// Set the per-request timeout. Defaults to 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the exporter.
    pub fn build(self) -> TraceResult<HttpSpanExporter> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| TraceError::Other(format!("cannot build http client: {err}")))?;

        Ok(HttpSpanExporter {
            endpoint: self.endpoint,
            client,
            service_name: crate::config::DEFAULT_SERVICE_NAME.to_owned(),
        })
    }
}

impl SpanExporter for HttpSpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let body = batch_payload(&self.service_name, &batch).to_string();
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        Box::pin(futures_util::future::lazy(move |_| {
            let response = client
                .post(&endpoint)
                .header(http::header::CONTENT_TYPE.as_str(), "application/json")
                .body(body)
                .send()
                .map_err(|err| TraceError::ExportFailed(err.to_string()))?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(TraceError::ExportFailed(format!(
                    "collector returned {}",
                    response.status()
                )))
            }
        }))
    }

    fn set_service_name(&mut self, service_name: &str) {
        self.service_name = service_name.to_owned();
    }
}

fn batch_payload(service_name: &str, batch: &[SpanData]) -> serde_json::Value {
    json!({
        "resource": { "service.name": service_name },
        "spans": batch.iter().map(span_payload).collect::<Vec<_>>(),
    })
}

fn span_payload(span: &SpanData) -> serde_json::Value {
    json!({
        "traceId": span.span_context.trace_id().to_string(),
        "spanId": span.span_context.span_id().to_string(),
        "parentSpanId": if span.parent_span_id == SpanId::INVALID {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(span.parent_span_id.to_string())
        },
        "name": span.name.as_ref(),
        "startTimeUnixNano": time_unix_nano(span.start_time),
        "endTimeUnixNano": time_unix_nano(span.end_time),
        "attributes": span
            .attributes
            .iter()
            .map(|kv| (kv.key.to_string(), value_payload(&kv.value)))
            .collect::<serde_json::Map<_, _>>(),
        "events": span
            .events
            .iter()
            .map(|event| {
                json!({
                    "name": event.name.as_ref(),
                    "timeUnixNano": time_unix_nano(event.timestamp),
                    "attributes": event
                        .attributes
                        .iter()
                        .map(|kv| (kv.key.to_string(), value_payload(&kv.value)))
                        .collect::<serde_json::Map<_, _>>(),
                })
            })
            .collect::<Vec<_>>(),
        "status": status_payload(span),
    })
}

fn status_payload(span: &SpanData) -> serde_json::Value {
    match &span.status {
        crate::span::Status::Unset => json!({ "code": "UNSET" }),
        crate::span::Status::Ok => json!({ "code": "OK" }),
        crate::span::Status::Error { description } => {
            json!({ "code": "ERROR", "message": description.as_ref() })
        }
    }
}

fn value_payload(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(v) => json!(v),
        Value::I64(v) => json!(v),
        Value::F64(v) => json!(v),
        Value::String(v) => json!(v.as_ref()),
    }
}

fn time_unix_nano(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}
