//! trace-spool: a crash-tolerant local span buffer with a background
//! OTLP/HTTP exporter.
//!
//! Instrumented code hands encoded span payloads to a [`Backend`], which
//! writes them to a file-backed buffer and returns immediately. A background
//! thread drains the buffer to the configured collector, deleting records
//! only after the collector acknowledged them. Records survive process
//! restarts, collector outages and destination changes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Backend facade (backend.rs)                        │  ← Entry point
//! │  - emit / set_destination / flush / shutdown        │
//! └─────────────────────────────────────────────────────┘
//!              │                          │
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ Storage Layer (storage/) │   │ Export Layer (export/)   │
//! │ - Buffer transactions    │ ← │ - Drain thread           │
//! │ - Pending set, priority  │   │ - Batching, backoff      │
//! │ - JSON snapshot, journal │   │ - OTLP/HTTP transport    │
//! └──────────────────────────┘   └──────────────────────────┘
//!              │                          │
//! ┌─────────────────────────────────────────────────────┐
//! │  Domain & Infrastructure                            │
//! │  - Destination, SpanRecord, Priority (domain/)      │
//! │  - Error types (domain/error)                       │
//! │  - Default paths (infrastructure/)                  │
//! └─────────────────────────────────────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────────────┐
//! │  Observability (observability/)                     │  ← Optional
//! │  - Logging setup                                    │
//! │  - tracing → OpenTelemetry → buffer bridge          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backend`]: The [`Backend`] facade
//! - [`config`]: [`BackendConfig`] and its loaders
//! - [`domain`]: Core types (destination, records, errors)
//! - [`storage`]: Durable buffer and its JSON file backend
//! - [`export`]: Background exporter, batching, transport
//! - [`infrastructure`]: Platform-specific utilities (paths)
//! - [`observability`]: Logging and OpenTelemetry integration
//!
//! # Delivery Guarantees
//!
//! - At least once: a record is deleted only after a 2xx response. A crash
//!   between send and delete means it is sent again.
//! - Records already handed to an export attempt are marked observed and go
//!   out ahead of fresh ones after a restart.
//! - Delivery failures are logged and retried with bounded exponential
//!   backoff; they never surface to the caller of [`Backend::emit`].
//! - The buffer is capped at [`BackendConfig::max_buffer_bytes`] of payload;
//!   past that, the oldest fresh records are evicted first.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use trace_spool::{Backend, BackendConfig, DrainOutcome};
//!
//! let backend = Backend::start(BackendConfig::default())?;
//! backend.set_destination(Some("http://localhost:4318/v1/traces"), None)?;
//!
//! let payload = br#"{"resourceSpans":[]}"#.to_vec();
//! backend.emit(payload, "application/json")?;
//!
//! match backend.shutdown(Duration::from_secs(5))? {
//!     DrainOutcome::Delivered(n) => println!("delivered {n} records"),
//!     other => println!("left for next start: {other:?}"),
//! }
//! # Ok::<(), trace_spool::SpoolError>(())
//! ```

#![allow(clippy::multiple_crate_versions)]

pub mod backend;
pub mod config;
pub mod domain;
pub mod export;
pub mod infrastructure;
pub mod observability;
pub mod storage;

pub use backend::Backend;
pub use config::BackendConfig;
pub use domain::{DeliveryError, Destination, Priority, Result, SpanRecord, SpoolError};
pub use export::{DrainOutcome, ExporterState, RetryConfig, MIME_JSON, MIME_PROTOBUF};
pub use storage::{Buffer, BufferStats};
