//! Delivery of buffered records to the remote collector.
//!
//! The [`exporter`] drains the buffer in the background, grouping records
//! with [`batch`], sending them through a [`transport`] and spacing out
//! retries with [`backoff`].

pub mod backoff;
pub mod batch;
pub mod exporter;
pub mod transport;

pub use backoff::{Backoff, RetryConfig};
pub use batch::{Batch, BatchBuilder, MIME_JSON, MIME_PROTOBUF};
pub use exporter::{DrainOutcome, Exporter, ExporterConfig, ExporterHandle, ExporterState};
pub use transport::{HttpTransport, Transport};
