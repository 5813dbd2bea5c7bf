//! Storage backend abstraction.
//!
//! The buffer keeps the live image in memory. The backend reads the whole
//! store once at startup, makes each committed transaction durable by
//! appending its changes, and now and then folds those changes into a fresh
//! snapshot.

use crate::domain::error::Result;
use crate::storage::models::{JournalOp, StoreData};

/// Persistent home of the buffer's [`StoreData`].
///
/// # Implementations
///
/// - [`crate::storage::JsonStorage`]: JSON snapshot plus JSON-lines journal (default)
///
/// # Contract
///
/// `append` and `persist` are each all-or-nothing. After either returns an
/// error, a subsequent `load` yields the state before the call; after it
/// returns `Ok`, the new state survives a crash.
pub trait Storage: Send + Sync {
    /// Loads the persisted store, creating an empty one if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store exists but cannot be read or decoded.
    fn load(&self) -> Result<StoreData>;

    /// Durably records the changes of one committed transaction.
    ///
    /// # Parameters
    ///
    /// - `ops`: the transaction's changes, in the order they were made
    ///
    /// # Errors
    ///
    /// Returns an error if the changes could not be made durable.
    fn append(&self, ops: &[JournalOp]) -> Result<()>;

    /// Atomically replaces the persisted store with `data` and discards the
    /// journal it supersedes.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state could not be made durable.
    fn persist(&self, data: &StoreData) -> Result<()>;

    /// Bytes appended since the last snapshot.
    ///
    /// # Returns
    ///
    /// `0` right after [`Storage::persist`]. Backends without a journal
    /// always return `0`.
    fn journal_bytes(&self) -> u64;
}
