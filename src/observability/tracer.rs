//! OpenTelemetry span exporter writing into the durable buffer.
//!
//! Finished spans are encoded as OTLP JSON and enqueued like any other
//! payload, so they survive restarts and reach the collector through the
//! same exporter thread.

use super::span_formatter::SpanFormatter;
use crate::export::MIME_JSON;
use crate::storage::Buffer;
use futures_util::future::BoxFuture;
use opentelemetry::trace::TraceError;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::TracerProvider;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Instrumentation scope name stamped on exported spans.
pub const SCOPE_NAME: &str = "trace-spool";

/// `SpanExporter` that enqueues each batch into a [`Buffer`].
///
/// Export never touches the network; it costs one buffer transaction.
pub struct BufferingSpanExporter {
    buffer: Arc<Buffer>,
    formatter: SpanFormatter,
    is_shutdown: AtomicBool,
}

impl BufferingSpanExporter {
    /// Creates an exporter enqueueing into `buffer`.
    pub fn new(buffer: Arc<Buffer>, resource: Resource) -> Self {
        Self {
            buffer,
            formatter: SpanFormatter::new(resource, SCOPE_NAME),
            is_shutdown: AtomicBool::new(false),
        }
    }
}

impl SpanExporter for BufferingSpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Box::pin(std::future::ready(Err(TraceError::from(
                "exporter is shut down",
            ))));
        }
        if batch.is_empty() {
            return Box::pin(std::future::ready(Ok(())));
        }

        let payload = self.formatter.encode(&batch);
        let result = self
            .buffer
            .enqueue(payload, MIME_JSON)
            .map(|_| ())
            .map_err(|e| TraceError::from(e.to_string()));

        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.formatter.set_resource(resource.clone());
    }
}

impl std::fmt::Debug for BufferingSpanExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferingSpanExporter")
            .field("buffer", &self.buffer)
            .field("formatter", &self.formatter)
            .field("is_shutdown", &self.is_shutdown)
            .finish()
    }
}

/// Creates a tracer provider whose spans end up in `buffer`.
///
/// Spans are exported one at a time as they end (simple processor): the
/// buffer already batches on the way out, and nothing sits in memory where a
/// crash could lose it.
///
/// # Example
///
/// ```no_run
/// use opentelemetry::trace::{Span, Tracer, TracerProvider as _};
/// use opentelemetry::KeyValue;
/// use opentelemetry_sdk::resource::Resource;
/// use std::sync::Arc;
/// use trace_spool::observability::create_tracer_provider;
/// use trace_spool::storage::Buffer;
///
/// let buffer = Arc::new(Buffer::open("/tmp/buffer.json".into(), 1 << 20)?);
/// let resource = Resource::new(vec![KeyValue::new("service.name", "myapp")]);
/// let provider = create_tracer_provider(buffer, resource);
///
/// let mut span = provider.tracer("myapp").start("work");
/// span.end();
/// # Ok::<(), trace_spool::SpoolError>(())
/// ```
pub fn create_tracer_provider(buffer: Arc<Buffer>, resource: Resource) -> TracerProvider {
    let exporter = BufferingSpanExporter::new(buffer, resource.clone());

    TracerProvider::builder()
        .with_config(opentelemetry_sdk::trace::Config::default().with_resource(resource))
        .with_simple_exporter(exporter)
        .build()
}
