//! Process-wide entry point.
//!
//! A [`Backend`] owns the durable buffer and the exporter thread draining it.
//! Construct one before the first span is emitted and pass it (or an `Arc` of
//! it) to whatever produces spans. Tear it down with [`Backend::shutdown`] to
//! get a final delivery attempt; dropping it stops the exporter without one.
//!
//! ```no_run
//! use std::time::Duration;
//! use trace_spool::{Backend, BackendConfig};
//!
//! let backend = Backend::start(BackendConfig::default())?;
//! backend.set_destination(Some("https://collector.example:4318/v1/traces"), None)?;
//!
//! backend.emit(b"\x0a\x00".to_vec(), "application/x-protobuf")?;
//!
//! backend.shutdown(Duration::from_secs(5))?;
//! # Ok::<(), trace_spool::SpoolError>(())
//! ```

use crate::config::BackendConfig;
use crate::domain::error::Result;
use crate::domain::Destination;
use crate::export::{DrainOutcome, Exporter, ExporterHandle, ExporterState, HttpTransport, Transport};
use crate::storage::{Buffer, BufferStats};
use std::sync::Arc;
use std::time::Duration;

/// Buffer plus exporter, wired together.
pub struct Backend {
    buffer: Arc<Buffer>,
    exporter: ExporterHandle,
    config: BackendConfig,
}

impl Backend {
    /// Opens the buffer and starts exporting over OTLP/HTTP.
    ///
    /// Records and the destination left by a previous process are picked up
    /// from `config.buffer_path`, and delivery resumes right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer file cannot be opened or the exporter
    /// thread cannot be started.
    pub fn start(config: BackendConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.send_timeout);
        Self::with_transport(config, transport)
    }

    /// Like [`Backend::start`], delivering through `transport`.
    ///
    /// # Errors
    ///
    /// Same as [`Backend::start`].
    pub fn with_transport<T>(config: BackendConfig, transport: T) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let buffer = Arc::new(Buffer::open(
            config.buffer_path.clone(),
            config.max_buffer_bytes,
        )?);
        let exporter =
            Exporter::new(Arc::clone(&buffer), transport, config.exporter_config()).spawn()?;

        tracing::info!(
            path = ?config.buffer_path,
            records = buffer.len()?,
            destination = ?buffer.destination()?.url(),
            "span backend started"
        );

        Ok(Self {
            buffer,
            exporter,
            config,
        })
    }

    /// Buffers one encoded payload for delivery and returns its id.
    ///
    /// Never waits on the network.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record could not be persisted.
    pub fn emit(&self, data: impl Into<Vec<u8>>, mime: &str) -> Result<u64> {
        self.buffer.enqueue(data.into(), mime)
    }

    /// Validates and persists the collector address.
    ///
    /// `None` for `url` pauses delivery; buffered records are kept. Setting
    /// the current value again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SpoolError::InvalidDestination`] for anything but an
    /// `http`/`https` URL, leaving the stored destination unchanged, or a
    /// storage error if it could not be persisted.
    pub fn set_destination(&self, url: Option<&str>, ca: Option<&str>) -> Result<()> {
        let destination = Destination::new(url, ca)?;
        if self.buffer.destination()? == destination {
            tracing::debug!("destination unchanged");
            return Ok(());
        }

        self.buffer.set_destination(destination)?;
        tracing::info!(
            url = url.unwrap_or("<none>"),
            custom_ca = ca.is_some(),
            "destination updated"
        );

        if let Err(e) = self.exporter.wake() {
            tracing::warn!(error = %e, "exporter not running, destination takes effect on restart");
        }
        Ok(())
    }

    /// Currently stored collector address.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be read.
    pub fn get_destination(&self) -> Result<Destination> {
        self.buffer.destination()
    }

    /// Moves records emitted so far to observed priority.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the change could not be persisted.
    pub fn mark_observed(&self) -> Result<()> {
        self.buffer.mark_observed()
    }

    /// Runs a drain cycle now and waits up to `timeout` for it.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the cycle, or
    /// [`crate::SpoolError::ExporterStopped`].
    pub fn flush(&self, timeout: Duration) -> Result<DrainOutcome> {
        self.exporter.flush(timeout)
    }

    /// Final flush, then stops the exporter.
    ///
    /// Records that could not be delivered stay in the buffer file for the
    /// next process.
    ///
    /// # Errors
    ///
    /// Same as [`Backend::flush`].
    pub fn shutdown(self, timeout: Duration) -> Result<DrainOutcome> {
        let outcome = self.exporter.shutdown(timeout);
        match &outcome {
            Ok(outcome) => tracing::info!(?outcome, "span backend stopped"),
            Err(e) => tracing::warn!(error = %e, "span backend stopped with error"),
        }
        outcome
    }

    /// The underlying buffer.
    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Buffer occupancy.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be read.
    pub fn stats(&self) -> Result<BufferStats> {
        self.buffer.stats()
    }

    /// State of the exporter thread.
    #[must_use]
    pub fn exporter_state(&self) -> ExporterState {
        self.exporter.state()
    }

    /// Configuration the backend was started with.
    #[must_use]
    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("buffer", &self.buffer)
            .field("exporter", &self.exporter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SpoolError;
    use crate::export::transport::RecordingTransport;
    use crate::export::MIME_PROTOBUF;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(dir: &std::path::Path) -> BackendConfig {
        BackendConfig {
            buffer_path: dir.join("buffer.json"),
            drain_interval: Duration::from_secs(3600),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn rejected_destination_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::with_transport(config(dir.path()), RecordingTransport::new()).unwrap();
        backend.set_destination(Some("http://a.com"), None).unwrap();

        for bad in ["file:///etc/passwd", "gopher://aaa"] {
            let err = backend.set_destination(Some(bad), None).unwrap_err();
            assert!(matches!(err, SpoolError::InvalidDestination(_)), "{bad}: {err}");
        }
        assert_eq!(backend.get_destination().unwrap().url(), Some("http://a.com"));
    }

    #[test]
    fn repeated_destination_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::with_transport(config(dir.path()), RecordingTransport::new()).unwrap();

        backend.set_destination(Some("http://a.com"), None).unwrap();
        let first = backend.get_destination().unwrap();
        backend.set_destination(Some("http://a.com"), None).unwrap();
        assert_eq!(backend.get_destination().unwrap(), first);
    }

    #[test]
    fn clearing_destination_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport::new();
        let backend = Backend::with_transport(config(dir.path()), transport.clone()).unwrap();
        backend.set_destination(Some("http://a.com"), None).unwrap();
        assert_eq!(backend.flush(WAIT).unwrap(), DrainOutcome::Delivered(0));
        backend.set_destination(None, None).unwrap();

        backend.emit(b"a".to_vec(), MIME_PROTOBUF).unwrap();
        backend.emit(b"b".to_vec(), MIME_PROTOBUF).unwrap();

        assert_eq!(backend.get_destination().unwrap(), Destination::disabled());
        assert_eq!(backend.flush(WAIT).unwrap(), DrainOutcome::Disabled { delivered: 0 });
        assert_eq!(backend.exporter_state(), ExporterState::Disabled);
        assert_eq!(backend.stats().unwrap().records, 2);
        assert_eq!(transport.attempts(), 0);
    }

    #[test]
    fn flush_delivers_emitted_records() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport::new();
        let backend = Backend::with_transport(config(dir.path()), transport.clone()).unwrap();

        let first = backend.emit(b"a".to_vec(), MIME_PROTOBUF).unwrap();
        let second = backend.emit(b"b".to_vec(), MIME_PROTOBUF).unwrap();
        assert!(second > first);

        backend.set_destination(Some("http://a.com/v1/traces"), None).unwrap();
        assert!(matches!(backend.flush(WAIT).unwrap(), DrainOutcome::Delivered(_)));
        assert!(backend.buffer().is_empty().unwrap());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, b"ab");

        assert_eq!(backend.shutdown(WAIT).unwrap(), DrainOutcome::Delivered(0));
    }
}
