//! # Outbound HTTP Instrumentation
//!
//! A thin wrapper over an HTTP client that traces each outgoing request:
//! it starts a child span named after the request method, injects the
//! `traceparent` header so the server can continue the trace, records the
//! response status, and ends the span when the response (or the transport
//! error) arrives.
//!
//! Instrumentation must never break the instrumented call. Every telemetry
//! operation in [`TracedClient::send`] is best-effort; the request outcome
//! returned to the caller is exactly what the inner client produced.

use crate::common::KeyValue;
use crate::propagation::{Extractor, Injector, TraceContextPropagator};
use crate::span::Status;
use crate::trace_context::SpanContext;
use crate::tracer::Tracer;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};

/// Error type for transport failures reported by [`HttpClient`]s.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Injects trace context into [`http::HeaderMap`]s.
///
/// Keys or values that fail header validation are silently skipped.
#[derive(Debug)]
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = HeaderName::from_bytes(key.as_bytes()) {
            if let Ok(val) = HeaderValue::from_str(&value) {
                self.0.insert(name, val);
            }
        }
    }
}

/// Extracts trace context from [`http::HeaderMap`]s.
#[derive(Debug)]
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }
}

/// Decode the span context carried in a request's headers, if any.
///
/// Intended for server-side handlers that want to continue the trace an
/// instrumented client started.
pub fn extract_remote_context(headers: &HeaderMap) -> Option<SpanContext> {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}

/// A minimal interface necessary for sending requests over HTTP.
/// Used for sending the instrumented requests.
#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    /// Send the specified HTTP request with `Bytes` payload.
    ///
    /// Returns the full response body as `Bytes`. Non-success status codes
    /// are returned as responses, not errors; only transport failures
    /// produce an `Err`.
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}

#[async_trait]
impl HttpClient for reqwest::Client {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let request = request.try_into()?;
        let mut response = self.execute(request).await?;
        let headers = std::mem::take(response.headers_mut());
        let mut http_response = Response::builder()
            .status(response.status())
            .body(response.bytes().await?)?;
        *http_response.headers_mut() = headers;

        Ok(http_response)
    }
}

#[async_trait]
impl HttpClient for reqwest::blocking::Client {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let request = request.try_into()?;
        let mut response = self.execute(request)?;
        let headers = std::mem::take(response.headers_mut());
        let mut http_response = Response::builder()
            .status(response.status())
            .body(response.bytes()?)?;
        *http_response.headers_mut() = headers;

        Ok(http_response)
    }
}

/// An [`HttpClient`] wrapper that traces every request it sends.
///
/// Each call to [`send`](TracedClient::send) produces one span covering the
/// full request/response exchange, parented under the caller's span when one
/// is provided.
#[derive(Debug)]
pub struct TracedClient<C> {
    inner: C,
    tracer: Tracer,
}

impl<C: HttpClient> TracedClient<C> {
    /// Wrap a client so its requests are traced by `tracer`.
    pub fn new(inner: C, tracer: Tracer) -> Self {
        TracedClient { inner, tracer }
    }

    /// A reference to the wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Send a request, tracing the exchange.
    ///
    /// The span is named `HTTP {method}` and carries the request method and
    /// url as attributes. The `traceparent` header is injected into the
    /// outgoing request; any caller-provided value for it is replaced. On a
    /// response the status code is recorded, and status codes `400` and
    /// above mark the span as errored. A transport failure is recorded as
    /// an exception event and the error is returned unchanged.
    pub async fn send(
        &self,
        mut request: Request<Bytes>,
        parent: Option<&SpanContext>,
    ) -> Result<Response<Bytes>, HttpError> {
        let mut builder = self
            .tracer
            .span_builder(format!("HTTP {}", request.method()))
            .with_attributes(vec![
                KeyValue::new("http.request.method", request.method().to_string()),
                KeyValue::new("url.full", request.uri().to_string()),
            ]);
        if let Some(parent) = parent {
            builder = builder.with_parent(parent.clone());
        }
        let mut span = builder.start(&self.tracer);

        TraceContextPropagator::new()
            .inject(span.span_context(), &mut HeaderInjector(request.headers_mut()));

        let result = self.inner.send_bytes(request).await;
        match &result {
            Ok(response) => {
                let status = response.status();
                let _ = span.set_attribute(KeyValue::new(
                    "http.response.status_code",
                    status.as_u16() as i64,
                ));
                if status.is_client_error() || status.is_server_error() {
                    let _ = span.set_status(Status::error(status.to_string()));
                }
            }
            Err(err) => {
                let _ = span.record_exception(err.as_ref());
                let _ = span.set_status(Status::error(err.to_string()));
            }
        }
        let _ = span.end();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::InMemorySpanExporter;
    use crate::propagation::TRACEPARENT_HEADER;
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    /// Drives a future to completion without futures-executor's `enter`
    /// guard, so the `block_on` inside `SimpleSpanProcessor::on_end` can
    /// run while the test future is being polled.
    fn block_on<F: Future>(fut: F) -> F::Output {
        let mut fut = std::pin::pin!(fut);
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
                return output;
            }
        }
    }

    /// Replies with a canned status and captures the request headers.
    #[derive(Clone, Debug)]
    struct MockClient {
        status: u16,
        fail: bool,
        seen_headers: Arc<Mutex<Option<HeaderMap>>>,
    }

    impl MockClient {
        fn with_status(status: u16) -> Self {
            MockClient {
                status,
                fail: false,
                seen_headers: Arc::new(Mutex::new(None)),
            }
        }

        fn failing() -> Self {
            MockClient {
                status: 0,
                fail: true,
                seen_headers: Arc::new(Mutex::new(None)),
            }
        }

        fn seen_headers(&self) -> HeaderMap {
            self.seen_headers.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn send_bytes(
            &self,
            request: Request<Bytes>,
        ) -> Result<Response<Bytes>, HttpError> {
            *self.seen_headers.lock().unwrap() = Some(request.headers().clone());
            if self.fail {
                return Err("connection refused".into());
            }
            Ok(Response::builder()
                .status(self.status)
                .body(Bytes::new())
                .unwrap())
        }
    }

    fn traced_client(status_or_fail: MockClient) -> (TracedClient<MockClient>, InMemorySpanExporter)
    {
        let exporter = InMemorySpanExporter::default();
        let tracer = Tracer::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (TracedClient::new(status_or_fail, tracer), exporter)
    }

    fn get_request() -> Request<Bytes> {
        Request::builder()
            .method("GET")
            .uri("http://api.example.com/items")
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn successful_request_produces_span_with_status_code() {
        let (client, exporter) = traced_client(MockClient::with_status(200));
        let response = block_on(client.send(get_request(), None)).unwrap();
        assert_eq!(response.status(), 200);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "HTTP GET");
        assert_eq!(span.status, Status::Unset);
        let status_code = span
            .attributes
            .iter()
            .find(|kv| kv.key.as_str() == "http.response.status_code")
            .unwrap();
        assert_eq!(status_code.value, 200_i64.into());
    }

    #[test]
    fn traceparent_header_is_injected() {
        let mock = MockClient::with_status(204);
        let (client, exporter) = traced_client(mock.clone());
        block_on(client.send(get_request(), None)).unwrap();

        let headers = mock.seen_headers();
        let header = headers.get(TRACEPARENT_HEADER).unwrap().to_str().unwrap();
        let span = &exporter.get_finished_spans().unwrap()[0];
        assert_eq!(
            header,
            format!(
                "00-{}-{}-01",
                span.span_context.trace_id(),
                span.span_context.span_id()
            )
        );
    }

    #[test]
    fn request_span_is_parented_under_caller_span() {
        let (client, exporter) = traced_client(MockClient::with_status(200));
        let parent = client.tracer.start("user_interaction");
        let parent_context = parent.span_context().clone();

        block_on(client.send(get_request(), Some(&parent_context))).unwrap();

        let span = &exporter.get_finished_spans().unwrap()[0];
        assert_eq!(span.span_context.trace_id(), parent_context.trace_id());
        assert_eq!(span.parent_span_id, parent_context.span_id());
    }

    #[test]
    fn server_error_marks_span_errored_but_returns_response() {
        let (client, exporter) = traced_client(MockClient::with_status(503));
        let response = block_on(client.send(get_request(), None)).unwrap();
        assert_eq!(response.status(), 503);

        let span = &exporter.get_finished_spans().unwrap()[0];
        assert!(matches!(span.status, Status::Error { .. }));
    }

    #[test]
    fn transport_failure_records_exception_and_returns_error() {
        let (client, exporter) = traced_client(MockClient::failing());
        let result = block_on(client.send(get_request(), None));
        assert!(result.is_err());

        let span = &exporter.get_finished_spans().unwrap()[0];
        assert!(matches!(span.status, Status::Error { .. }));
        assert_eq!(span.events.len(), 1);
        assert_eq!(span.events[0].name, "exception");
    }

    #[test]
    fn remote_context_round_trips_through_header_map() {
        let mock = MockClient::with_status(200);
        let (client, exporter) = traced_client(mock.clone());
        block_on(client.send(get_request(), None)).unwrap();

        let extracted = extract_remote_context(&mock.seen_headers()).unwrap();
        let span = &exporter.get_finished_spans().unwrap()[0];
        assert_eq!(extracted.trace_id(), span.span_context.trace_id());
        assert_eq!(extracted.span_id(), span.span_context.span_id());
        assert!(extracted.is_remote());
        assert!(extracted.is_sampled());
    }
}
