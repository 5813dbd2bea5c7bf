//! Core domain types, independent of storage format and transport.
//!
//! # Organization
//!
//! - [`error`]: Error types and result aliases
//! - [`destination`]: Validated collector address
//! - [`record`]: Span records and their drain priority
//!
//! # Examples
//!
//! ```
//! use trace_spool::domain::{Destination, Result};
//!
//! fn configure() -> Result<Destination> {
//!     Destination::new(Some("http://localhost:4318/v1/traces"), None)
//! }
//! assert!(configure().is_ok());
//! ```

pub mod destination;
pub mod error;
pub mod record;

pub use destination::Destination;
pub use error::{DeliveryError, Result, SpoolError};
pub use record::{Priority, SpanRecord};
