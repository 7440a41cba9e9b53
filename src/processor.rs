//! # Span Processor Interface
//!
//! Span processors sit between span creation and export: `Span::end` hands
//! the frozen span data to the processor, which decides when the exporter
//! runs. Two disciplines are provided. [`SimpleSpanProcessor`] exports each
//! span synchronously on the thread that ended it, which is only suitable
//! for low-volume or debugging use. [`BatchSpanProcessor`] decouples
//! producers from exporter I/O with a bounded queue and a dedicated
//! background thread, and is the recommended pipeline for production
//! traffic.
//!
//! ```ascii
//!   +------------------+   +-----------------------+   +-------------------+
//!   |                  |   |                       |   |                   |
//!   | Tracer           |   | (Batch)SpanProcessor  |   |    SpanExporter   |
//!   |   Span::end() ---+---> (Simple)SpanProcessor +--->  (HTTP collector) |
//!   |                  |   |                       |   |                   |
//!   +------------------+   +-----------------------+   +-------------------+
//! ```
//!
//! The queue is the one shared resource: when it is full, new spans are
//! dropped and counted rather than blocking producers or growing without
//! bound. Export failures are logged and the batch is discarded; spans are
//! never retried or persisted.

use crate::error::{TraceError, TraceResult};
use crate::export::SpanExporter;
use crate::span::SpanData;
use futures_executor::block_on;
use std::cmp::min;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use std::{env, str::FromStr};

/// Delay interval between two consecutive exports.
pub(crate) const RUMTRACE_BSP_SCHEDULE_DELAY: &str = "RUMTRACE_BSP_SCHEDULE_DELAY";
/// Default delay interval between two consecutive exports, in milliseconds.
pub(crate) const RUMTRACE_BSP_SCHEDULE_DELAY_DEFAULT: u64 = 5_000;
/// Maximum queue size.
pub(crate) const RUMTRACE_BSP_MAX_QUEUE_SIZE: &str = "RUMTRACE_BSP_MAX_QUEUE_SIZE";
/// Default maximum queue size.
pub(crate) const RUMTRACE_BSP_MAX_QUEUE_SIZE_DEFAULT: usize = 2_048;
/// Maximum batch size, must be less than or equal to the max queue size.
pub(crate) const RUMTRACE_BSP_MAX_EXPORT_BATCH_SIZE: &str = "RUMTRACE_BSP_MAX_EXPORT_BATCH_SIZE";
/// Default maximum batch size.
pub(crate) const RUMTRACE_BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT: usize = 512;
/// Maximum allowed time to export data, also bounds flush and shutdown.
pub(crate) const RUMTRACE_BSP_EXPORT_TIMEOUT: &str = "RUMTRACE_BSP_EXPORT_TIMEOUT";
/// Default maximum allowed time to export data, in milliseconds.
pub(crate) const RUMTRACE_BSP_EXPORT_TIMEOUT_DEFAULT: u64 = 30_000;

/// `SpanProcessor` is the interface that receives ended spans from the
/// tracer and forwards them to an exporter.
pub trait SpanProcessor: Send + Sync + std::fmt::Debug {
    /// `on_end` is called after a `Span` is ended (i.e., the end timestamp
    /// is already set). This method is called synchronously within the
    /// `Span::end` API, therefore it should not block.
    fn on_end(&self, span: SpanData);
    /// Force the spans lying in the cache to be exported.
    fn force_flush(&self) -> TraceResult<()>;
    /// Shuts down the processor. Implementations should make a final
    /// bounded flush attempt and then release resources.
    fn shutdown(&self) -> TraceResult<()>;
    /// Set the service name forwarded to the exporter.
    fn set_service_name(&mut self, _service_name: &str) {}
}

/// A [`SpanProcessor`] that passes finished spans to the configured
/// exporter as soon as they are finished, without any batching.
///
/// Exporter latency lands on the thread that called `end()`.
#[derive(Debug)]
pub struct SimpleSpanProcessor {
    exporter: Mutex<Box<dyn SpanExporter>>,
}

impl SimpleSpanProcessor {
    /// Create a new [`SimpleSpanProcessor`] using the provided exporter.
    pub fn new(exporter: Box<dyn SpanExporter>) -> Self {
        Self {
            exporter: Mutex::new(exporter),
        }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_end(&self, span: SpanData) {
        if !span.span_context.is_sampled() {
            return;
        }

        let result = self
            .exporter
            .lock()
            .map_err(|_| TraceError::Other("SimpleSpanProcessor mutex poison".into()))
            .and_then(|mut exporter| block_on(exporter.export(vec![span])));

        if let Err(err) = result {
            // Telemetry failures stay inside the pipeline; the span producer
            // is never affected.
            tracing::warn!(error = %err, "simple span processor export failed, span dropped");
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        // Nothing buffered in the simple span processor.
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        if let Ok(mut exporter) = self.exporter.lock() {
            exporter.shutdown();
            Ok(())
        } else {
            Err(TraceError::Other(
                "SimpleSpanProcessor mutex poison at shutdown".into(),
            ))
        }
    }

    fn set_service_name(&mut self, service_name: &str) {
        if let Ok(mut exporter) = self.exporter.lock() {
            exporter.set_service_name(service_name);
        }
    }
}

/// Messages exchanged between producers and the background thread.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum BatchMessage {
    ExportSpan(SpanData),
    ForceFlush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
    SetServiceName(String),
}

/// A batch span processor with a dedicated background thread.
///
/// Ended spans are enqueued on a bounded channel; the background thread
/// accumulates them and exports when the pending batch reaches
/// `max_export_batch_size` or `scheduled_delay` has elapsed, whichever
/// comes first. When the queue is full the span is dropped and counted; a
/// warning is logged on the first drop and a total is logged at shutdown.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
    is_shutdown: AtomicBool,
    dropped_span_count: Arc<AtomicUsize>,
}

impl BatchSpanProcessor {
    /// Creates a new instance of `BatchSpanProcessor` with a dedicated
    /// background thread.
    pub fn new<E>(mut exporter: E, config: BatchConfig) -> Self
    where
        E: SpanExporter + Send + 'static,
    {
        let (message_sender, message_receiver) = sync_channel(config.max_queue_size);
        let max_export_timeout = config.max_export_timeout;
        let dropped_span_count = Arc::new(AtomicUsize::new(0));
        let dropped_span_count_for_thread = dropped_span_count.clone();

        let handle = thread::Builder::new()
            .name("rumtrace-batch-span-processor".to_string())
            .spawn(move || {
                let mut spans = Vec::with_capacity(config.max_export_batch_size);
                let mut last_export_time = Instant::now();

                loop {
                    let timeout = config
                        .scheduled_delay
                        .saturating_sub(last_export_time.elapsed());
                    match message_receiver.recv_timeout(timeout) {
                        Ok(message) => match message {
                            BatchMessage::ExportSpan(span) => {
                                spans.push(span);
                                if spans.len() >= config.max_export_batch_size
                                    || last_export_time.elapsed() >= config.scheduled_delay
                                {
                                    export_batch(&mut exporter, &mut spans);
                                    last_export_time = Instant::now();
                                }
                            }
                            BatchMessage::ForceFlush(sender) => {
                                let result = block_on(exporter.export(spans.split_off(0)));
                                let _ = sender.send(result);
                                last_export_time = Instant::now();
                            }
                            BatchMessage::SetServiceName(service_name) => {
                                exporter.set_service_name(&service_name);
                            }
                            BatchMessage::Shutdown(sender) => {
                                let result = block_on(exporter.export(spans.split_off(0)));
                                exporter.shutdown();
                                let dropped =
                                    dropped_span_count_for_thread.load(Ordering::Relaxed);
                                if dropped > 0 {
                                    tracing::warn!(
                                        dropped_spans = dropped,
                                        "batch span processor dropped spans due to a full queue"
                                    );
                                }
                                let _ = sender.send(result);
                                break;
                            }
                        },
                        Err(RecvTimeoutError::Timeout) => {
                            if last_export_time.elapsed() >= config.scheduled_delay {
                                export_batch(&mut exporter, &mut spans);
                                last_export_time = Instant::now();
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            tracing::debug!(
                                "batch span processor channel disconnected, thread exiting"
                            );
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn batch span processor thread");

        Self {
            message_sender,
            handle: Mutex::new(Some(handle)),
            flush_timeout: max_export_timeout,
            shutdown_timeout: max_export_timeout,
            is_shutdown: AtomicBool::new(false),
            dropped_span_count,
        }
    }

    /// Create a builder with the default batch configuration.
    pub fn builder<E>(exporter: E) -> BatchSpanProcessorBuilder<E>
    where
        E: SpanExporter + Send + 'static,
    {
        BatchSpanProcessorBuilder {
            exporter,
            config: BatchConfig::default(),
        }
    }
}

fn export_batch<E: SpanExporter>(exporter: &mut E, spans: &mut Vec<SpanData>) {
    if spans.is_empty() {
        return;
    }
    if let Err(err) = block_on(exporter.export(spans.split_off(0))) {
        // At-most-once delivery: the batch is already gone from the queue
        // and is not retried.
        tracing::warn!(error = %err, "span batch export failed, batch dropped");
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        let result = self.message_sender.try_send(BatchMessage::ExportSpan(span));

        if result.is_err() {
            // Queue full or thread gone. Count the drop and warn only on
            // the first one to avoid flooding; the total is reported at
            // shutdown.
            if self.dropped_span_count.fetch_add(1, Ordering::Relaxed) == 0 {
                tracing::warn!(
                    "batch span processor queue full, dropping span; \
                     further drops will be reported at shutdown"
                );
            }
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::ForceFlush(sender))
            .map_err(|_| TraceError::Other("failed to send flush message".into()))?;

        receiver
            .recv_timeout(self.flush_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.flush_timeout))?
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::Shutdown(sender))
            .map_err(|_| TraceError::Other("failed to send shutdown message".into()))?;

        let result = receiver
            .recv_timeout(self.shutdown_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.shutdown_timeout))?;
        if let Some(handle) = self.handle.lock().ok().and_then(|mut guard| guard.take()) {
            handle
                .join()
                .map_err(|_| TraceError::Other("failed to join processor thread".into()))?;
        }
        result
    }

    fn set_service_name(&mut self, service_name: &str) {
        let _ = self
            .message_sender
            .try_send(BatchMessage::SetServiceName(service_name.to_owned()));
    }
}

/// Builder for [`BatchSpanProcessor`].
#[derive(Debug)]
pub struct BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + Send + 'static,
{
    exporter: E,
    config: BatchConfig,
}

impl<E> BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + Send + 'static,
{
    /// Set the [`BatchConfig`] for this builder.
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        BatchSpanProcessorBuilder { config, ..self }
    }

    /// Build a new instance of `BatchSpanProcessor`.
    pub fn build(self) -> BatchSpanProcessor {
        BatchSpanProcessor::new(self.exporter, self.config)
    }
}

/// Batch span processor configuration.
/// Use [`BatchConfigBuilder`] to configure your own instance.
#[derive(Debug)]
pub struct BatchConfig {
    /// The maximum queue size to buffer spans for delayed processing. If
    /// the queue gets full it drops the spans.
    pub(crate) max_queue_size: usize,

    /// The delay interval between two consecutive exports.
    pub(crate) scheduled_delay: Duration,

    /// The maximum number of spans to export in a single batch.
    pub(crate) max_export_batch_size: usize,

    /// The maximum duration allowed for an export, flush or shutdown to
    /// complete.
    pub(crate) max_export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// A builder for creating [`BatchConfig`] instances.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    max_export_timeout: Duration,
}

impl Default for BatchConfigBuilder {
    /// Create a new [`BatchConfigBuilder`] initialized with the default
    /// batch configuration, then overridden by environment variables if
    /// set. The supported environment variables are:
    /// * `RUMTRACE_BSP_MAX_QUEUE_SIZE`
    /// * `RUMTRACE_BSP_SCHEDULE_DELAY`
    /// * `RUMTRACE_BSP_MAX_EXPORT_BATCH_SIZE`
    /// * `RUMTRACE_BSP_EXPORT_TIMEOUT`
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: RUMTRACE_BSP_MAX_QUEUE_SIZE_DEFAULT,
            scheduled_delay: Duration::from_millis(RUMTRACE_BSP_SCHEDULE_DELAY_DEFAULT),
            max_export_batch_size: RUMTRACE_BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT,
            max_export_timeout: Duration::from_millis(RUMTRACE_BSP_EXPORT_TIMEOUT_DEFAULT),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Set the maximum queue size; spans are dropped once it is full.
    /// The default value is 2048.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the maximum number of spans exported in a single batch. Clamped
    /// to the queue size. The default value is 512.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set the delay interval between two consecutive batch exports.
    /// The default value is 5000 milliseconds.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set the maximum duration allowed for exports, flushes and the final
    /// shutdown flush. The default value is 30000 milliseconds.
    pub fn with_max_export_timeout(mut self, max_export_timeout: Duration) -> Self {
        self.max_export_timeout = max_export_timeout;
        self
    }

    /// Builds a `BatchConfig` enforcing that `max_export_batch_size` is
    /// less than or equal to `max_queue_size`.
    pub fn build(self) -> BatchConfig {
        let max_export_batch_size = min(self.max_export_batch_size, self.max_queue_size);

        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_timeout: self.max_export_timeout,
            max_export_batch_size,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env::var(RUMTRACE_BSP_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|queue_size| usize::from_str(&queue_size).ok())
        {
            self.max_queue_size = max_queue_size;
        }

        if let Some(scheduled_delay) = env::var(RUMTRACE_BSP_SCHEDULE_DELAY)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay);
        }

        if let Some(max_export_batch_size) = env::var(RUMTRACE_BSP_MAX_EXPORT_BATCH_SIZE)
            .ok()
            .and_then(|batch_size| usize::from_str(&batch_size).ok())
        {
            self.max_export_batch_size = max_export_batch_size;
        }

        if let Some(max_export_timeout) = env::var(RUMTRACE_BSP_EXPORT_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.max_export_timeout = Duration::from_millis(max_export_timeout);
        }

        self
    }
}
