//! Logging and OpenTelemetry integration.
//!
//! The crate logs through `tracing`. Applications that also record spans
//! through `tracing` can route them into the durable buffer:
//!
//! ```text
//! tracing spans → tracing-opentelemetry → OpenTelemetry SDK
//!   → BufferingSpanExporter → Buffer → exporter thread → collector
//! ```
//!
//! # Configuration
//!
//! Log level is controlled via:
//! 1. `RUST_LOG` environment variable (highest priority)
//! 2. `log_level` in [`crate::BackendConfig`]
//! 3. Default: `"info"`
//!
//! # Modules
//!
//! - `init`: Subscriber setup
//! - `tracer`: Span exporter and tracer provider
//! - `span_formatter`: OTLP JSON span serialization

mod init;
mod span_formatter;
mod tracer;

pub use init::{buffering_layer, init_logging, init_tracing, BufferingLayer};
pub use span_formatter::SpanFormatter;
pub use tracer::{create_tracer_provider, BufferingSpanExporter, SCOPE_NAME};
