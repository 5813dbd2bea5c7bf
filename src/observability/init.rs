//! Subscriber setup.
//!
//! Two entry points, both idempotent (only the first global subscriber
//! installed in a process takes effect):
//!
//! - [`init_logging`]: human-readable logs on stderr.
//! - [`init_tracing`]: the same logs plus an OpenTelemetry layer whose spans
//!   are written into a backend's buffer and exported from there.

use super::tracer::{self, SCOPE_NAME};
use crate::backend::Backend;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use std::sync::Arc;
use tracing::{Metadata, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::{filter_fn, FilterFn, Filtered};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Resolves the log filter.
///
/// Level is determined by:
/// 1. `RUST_LOG` if set and valid
/// 2. `level` if given
/// 3. Default: `"info"`
fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")))
}

/// True for events and spans emitted by this crate.
///
/// They are kept out of the OpenTelemetry layer: exporting the exporter's own
/// spans would enqueue a record for every drain cycle, forever.
fn is_internal(metadata: &Metadata<'_>) -> bool {
    let target = metadata.target();
    target == "trace_spool" || target.starts_with("trace_spool::")
}

/// Installs a stderr log subscriber.
///
/// # Example
///
/// ```rust
/// trace_spool::observability::init_logging(Some("debug"));
/// tracing::debug!("logging is now active");
/// ```
pub fn init_logging(level: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Layer returned by [`buffering_layer`].
pub type BufferingLayer<S> =
    Filtered<OpenTelemetryLayer<S, Tracer>, FilterFn<fn(&Metadata<'_>) -> bool>, S>;

/// OpenTelemetry layer feeding `provider`, with this crate's own
/// instrumentation filtered out.
///
/// Use it to compose a subscriber by hand instead of [`init_tracing`].
pub fn buffering_layer<S>(provider: &TracerProvider) -> BufferingLayer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let external: fn(&Metadata<'_>) -> bool = |metadata| !is_internal(metadata);
    OpenTelemetryLayer::new(provider.tracer(SCOPE_NAME)).with_filter(filter_fn(external))
}

/// Installs logging plus span export through `backend`.
///
/// Returns the tracer provider; keep it alive for as long as spans should be
/// recorded, and call `shutdown` on it before shutting the backend down.
///
/// # Example
///
/// ```no_run
/// use trace_spool::{Backend, BackendConfig};
///
/// let backend = Backend::start(BackendConfig::default())?;
/// let provider = trace_spool::observability::init_tracing(&backend);
///
/// tracing::info_span!("handle_request").in_scope(|| {
///     tracing::info!("span recorded into the buffer");
/// });
/// # Ok::<(), trace_spool::SpoolError>(())
/// ```
pub fn init_tracing(backend: &Backend) -> TracerProvider {
    let config = backend.config();
    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )]);
    let provider = tracer::create_tracer_provider(Arc::clone(backend.buffer()), resource);

    let _ = tracing_subscriber::registry()
        .with(env_filter(config.log_level.as_deref()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(buffering_layer(&provider))
        .try_init();

    provider
}
