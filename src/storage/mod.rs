//! Storage layer for the durable span buffer.
//!
//! The buffer keeps every undelivered record on disk as a JSON snapshot plus
//! a journal of committed changes, and mirrors it in memory. All reads and
//! writes go through scoped transactions on [`Buffer`]; each commit appends
//! one journal entry, and the snapshot is replaced atomically when the
//! journal is folded into it.
//!
//! # Modules
//!
//! - `backend`: Storage trait abstraction for backend implementations
//! - `json`: JSON file-based storage implementation
//! - `models`: Snapshot and journal layouts
//! - `buffer`: Transactions, pending set and record lifecycle

pub mod backend;
pub mod buffer;
pub mod json;
pub mod models;

pub use backend::Storage;
pub use buffer::{Buffer, BufferStats, PendingIter, Transaction, COMPACT_MIN_BYTES};
pub use json::JsonStorage;
pub use models::{JournalOp, StoreData};
