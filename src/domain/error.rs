//! Error types for the span buffer and its exporter.
//!
//! [`SpoolError`] covers everything calling code can observe: destination
//! validation failures and storage failures. Delivery problems never reach the
//! application; they are described by [`DeliveryError`] and stay inside the
//! exporter, which logs them and retries on a later drain cycle.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for buffer, configuration and backend operations.
///
/// # Examples
///
/// ```
/// use trace_spool::SpoolError;
///
/// fn reject() -> Result<(), SpoolError> {
///     Err(SpoolError::InvalidDestination("unsupported scheme: file".to_string()))
/// }
/// assert!(reject().is_err());
/// ```
#[derive(Debug, Error)]
pub enum SpoolError {
    /// The destination URL was rejected before being persisted.
    ///
    /// Only `http` and `https` endpoints are accepted. The previously stored
    /// destination is left untouched when this is returned.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Filesystem operation on the buffer file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage operation failed for a reason other than plain I/O
    /// (serialization, unexpected state).
    #[error("Storage error: {0}")]
    Storage(String),

    /// The buffer file exists but could not be decoded.
    #[error("Corrupt buffer file {path}: {reason}")]
    Corrupt {
        /// Location of the unreadable file.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// A mutation was attempted inside a read-only transaction.
    #[error("Write attempted in a read-only transaction")]
    ReadOnly,

    /// Configuration is invalid or could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The exporter thread is gone and cannot take requests.
    #[error("Exporter is not running")]
    ExporterStopped,
}

/// A specialized `Result` type for buffer and backend operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

/// Why a delivery attempt did not succeed.
///
/// The records involved always stay in the buffer at their current priority.
/// [`DeliveryError::halts_cycle`] decides whether the exporter keeps going
/// with the next batch or backs off right away.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection could not be established or broke mid-request.
    #[error("network error: {0}")]
    Network(String),

    /// The collector did not answer within the send timeout.
    #[error("request timed out")]
    Timeout,

    /// The collector answered with a non-2xx status.
    #[error("collector rejected batch with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The configured certificate material could not be used.
    #[error("certificate error: {0}")]
    Certificate(String),
}

impl DeliveryError {
    /// True when the collector is unreachable or overloaded, so sending the
    /// remaining batches in this cycle would fail the same way.
    ///
    /// A 4xx rejection (other than 408 and 429) concerns the batch itself and
    /// does not stop the cycle.
    #[must_use]
    pub const fn halts_cycle(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::Certificate(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> DeliveryError {
        DeliveryError::Rejected {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn outages_halt_the_cycle() {
        assert!(DeliveryError::Timeout.halts_cycle());
        assert!(DeliveryError::Network("refused".to_string()).halts_cycle());
        assert!(rejected(503).halts_cycle());
        assert!(rejected(429).halts_cycle());
    }

    #[test]
    fn bad_request_moves_on() {
        assert!(!rejected(400).halts_cycle());
        assert!(!rejected(413).halts_cycle());
    }
}
