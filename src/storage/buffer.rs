//! The durable span buffer.
//!
//! [`Buffer`] owns the persisted record store plus two pieces of in-memory
//! bookkeeping: the set of ids enqueued by this process that have not yet been
//! marked observed, and the `observed` flag telling the exporter whether that
//! set still needs to be flushed into persisted [`Priority::Observed`].
//!
//! # Transactions
//!
//! All access goes through [`Buffer::transaction`]. A read-only transaction
//! shares the store with other readers; a write transaction excludes everyone
//! else and changes the store in place, logging an undo step and a
//! [`JournalOp`] per change. On success the ops are appended to the journal
//! as one entry. An error from the caller's block, a failed append, or a
//! panic unwinds the undo log, so neither disk nor memory ever holds a
//! partial write. The lock is released on every exit path.
//!
//! A commit costs time in proportion to what it changed, not to what is
//! stored. Once the journal outgrows the live payload (and
//! [`COMPACT_MIN_BYTES`]) the store is folded into a new snapshot.
//!
//! # Concurrency
//!
//! Producers call [`Buffer::enqueue`] while the exporter drains. The exporter
//! reads records one short read transaction at a time and sends them with no
//! lock held, so a slow collector never stalls producers.
//!
//! Lock order is always store lock, then pending-set lock.

use crate::domain::error::{Result, SpoolError};
use crate::domain::{Destination, Priority, SpanRecord};
use crate::storage::backend::Storage;
use crate::storage::json::JsonStorage;
use crate::storage::models::{JournalOp, StoreData};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

/// Journal size below which no snapshot is taken.
pub const COMPACT_MIN_BYTES: u64 = 1 << 20;

/// In-memory view of what this process has enqueued but not yet marked.
#[derive(Debug, Default)]
struct PendingSet {
    ids: BTreeSet<u64>,
    observed: bool,
}

/// Snapshot of buffer occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    /// Records currently stored.
    pub records: usize,
    /// Records at [`Priority::Observed`].
    pub observed: usize,
    /// Sum of payload sizes.
    pub payload_bytes: u64,
    /// Enqueue time of the oldest stored record.
    pub oldest_created_at: Option<i64>,
}

/// Crash-safe, transactional store of pending span records.
pub struct Buffer {
    storage: Box<dyn Storage>,
    state: RwLock<StoreData>,
    pending: Mutex<PendingSet>,
    max_bytes: u64,
}

impl Buffer {
    /// Opens (or creates) the JSON buffer file at `path`.
    ///
    /// `max_bytes` caps the total payload size; see [`Buffer::enqueue`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or is corrupt.
    pub fn open(path: PathBuf, max_bytes: u64) -> Result<Self> {
        Self::with_storage(Box::new(JsonStorage::new(path)?), max_bytes)
    }

    /// Builds a buffer on top of an arbitrary storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to load.
    pub fn with_storage(storage: Box<dyn Storage>, max_bytes: u64) -> Result<Self> {
        let data = storage.load()?;
        if storage.journal_bytes() > 0 {
            // Also drops a torn tail, which later appends must not follow.
            storage.persist(&data)?;
        }

        tracing::debug!(
            records = data.records.len(),
            next_id = data.next_id,
            destination = ?data.destination.url(),
            "buffer opened"
        );

        Ok(Self {
            storage,
            state: RwLock::new(data),
            pending: Mutex::new(PendingSet::default()),
            max_bytes,
        })
    }

    /// Runs `f` inside a transaction.
    ///
    /// # Parameters
    ///
    /// - `readonly`: share access with other readers; any mutation fails
    ///   with [`SpoolError::ReadOnly`]
    /// - `f`: the block; without `readonly` it has exclusive access, and its
    ///   changes are made durable when it returns `Ok` and reverted when it
    ///   returns `Err`, panics, or the journal append fails
    ///
    /// # Returns
    ///
    /// Whatever `f` returned.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or the storage error from the commit.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use trace_spool::storage::Buffer;
    ///
    /// let buffer = Buffer::open("/tmp/buffer.json".into(), 1 << 20)?;
    /// let count = buffer.transaction(true, |tx| Ok(tx.len()))?;
    /// # Ok::<(), trace_spool::SpoolError>(())
    /// ```
    pub fn transaction<T, F>(&self, readonly: bool, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        if readonly {
            let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let mut tx = Transaction::shared(&guard);
            return f(&mut tx);
        }

        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut tx = Transaction::exclusive(&mut guard);
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "transaction rolled back");
                return Err(e);
            }
        };

        if !tx.journal.is_empty() {
            self.storage.append(&tx.journal)?;
        }
        tx.commit();
        drop(tx);

        self.compact_if_needed(&guard);
        Ok(value)
    }

    /// Folds the journal into a fresh snapshot now.
    ///
    /// Happens on its own once the journal outgrows the live data; this
    /// forces it, for instance before copying the buffer file elsewhere.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the snapshot could not be written. The
    /// journal stays valid in that case.
    pub fn compact(&self) -> Result<()> {
        let guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        self.storage.persist(&guard)
    }

    fn compact_if_needed(&self, data: &StoreData) {
        let journal = self.storage.journal_bytes();
        if journal < COMPACT_MIN_BYTES || journal < data.payload_bytes() {
            return;
        }

        match self.storage.persist(data) {
            Ok(()) => tracing::debug!(
                journal_bytes = journal,
                records = data.records.len(),
                "journal compacted"
            ),
            Err(e) => tracing::warn!(error = %e, "journal compaction failed, will retry"),
        }
    }

    /// Stores a payload and returns its id.
    ///
    /// # Parameters
    ///
    /// - `data`: encoded payload, stored as is
    /// - `mime`: content type the exporter sends it with
    ///
    /// The record gets [`Priority::Default`] and joins the pending set. If the
    /// buffer is now over its byte cap, the least urgent records (fresh before
    /// observed, oldest first) are evicted in the same transaction. The record
    /// being enqueued is never evicted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record could not be persisted.
    pub fn enqueue(&self, data: Vec<u8>, mime: &str) -> Result<u64> {
        let max_bytes = self.max_bytes;
        let size = data.len();

        let (id, evicted) = self.transaction(false, |tx| {
            let id = tx.insert(data, mime)?;
            let evicted = tx.evict_over(max_bytes, id)?;
            Ok((id, evicted))
        })?;

        let mut pending = self.lock_pending();
        pending.ids.insert(id);
        for gone in &evicted {
            pending.ids.remove(gone);
        }
        pending.observed = false;
        drop(pending);

        if !evicted.is_empty() {
            tracing::warn!(
                count = evicted.len(),
                max_bytes,
                "buffer over capacity, dropped oldest undelivered records"
            );
        }
        tracing::trace!(record_id = id, bytes = size, mime, "record enqueued");
        Ok(id)
    }

    /// Moves every pending id to [`Priority::Observed`].
    ///
    /// Ids that no longer exist in storage (already exported, or evicted) are
    /// skipped without error. Afterwards the pending set is empty and the
    /// buffer reports [`Buffer::is_observed`]. With nothing pending this only
    /// sets the flag and leaves storage untouched.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the priority change could not be persisted.
    /// The pending set is left as it was in that case.
    pub fn mark_observed(&self) -> Result<()> {
        let (snapshot, marked) = self.transaction(false, |tx| {
            let snapshot: Vec<u64> = self.lock_pending().ids.iter().copied().collect();
            let mut marked = 0usize;
            for id in &snapshot {
                if tx.set_priority(*id, Priority::Observed)? {
                    marked += 1;
                }
            }
            Ok((snapshot, marked))
        })?;

        let mut pending = self.lock_pending();
        for id in &snapshot {
            pending.ids.remove(id);
        }
        pending.observed = pending.ids.is_empty();
        drop(pending);

        tracing::debug!(
            pending = snapshot.len(),
            marked,
            "pending records marked observed"
        );
        Ok(())
    }

    /// Removes delivered records. Ids that are already gone are ignored.
    ///
    /// # Parameters
    ///
    /// - `ids`: records the collector acknowledged
    ///
    /// # Returns
    ///
    /// How many records were actually removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the deletion could not be persisted.
    pub fn delete(&self, ids: &[u64]) -> Result<usize> {
        let removed = self.transaction(false, |tx| {
            let mut removed = 0usize;
            for id in ids {
                if tx.delete(*id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })?;

        let mut pending = self.lock_pending();
        for id in ids {
            pending.ids.remove(id);
        }
        drop(pending);

        tracing::debug!(requested = ids.len(), removed, "records deleted");
        Ok(removed)
    }

    /// Lazily walks stored records in drain order.
    ///
    /// The order (priority ascending, then id ascending) is fixed when the
    /// iterator is created, and only records present at that moment are
    /// visited. Each record is fetched in its own short read transaction, so
    /// records deleted in the meantime are skipped and no lock is held
    /// between items.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial scan fails.
    pub fn iter(&self) -> Result<PendingIter<'_>> {
        let order = self.transaction(true, |tx| Ok(tx.drain_order()))?;
        Ok(PendingIter {
            buffer: self,
            order: order.into_iter(),
        })
    }

    /// Persists a new destination.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the change could not be persisted.
    pub fn set_destination(&self, destination: Destination) -> Result<()> {
        self.transaction(false, |tx| tx.set_destination(destination))
    }

    /// Currently persisted destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn destination(&self) -> Result<Destination> {
        self.transaction(true, |tx| Ok(tx.destination().clone()))
    }

    /// True once the pending set has been flushed into persisted priority.
    pub fn is_observed(&self) -> bool {
        self.lock_pending().observed
    }

    /// Ids enqueued by this process that are not yet marked observed.
    pub fn pending_ids(&self) -> Vec<u64> {
        self.lock_pending().ids.iter().copied().collect()
    }

    /// Adds an id to the pending set, so the next [`Buffer::mark_observed`]
    /// covers it. Unknown ids are tolerated there.
    pub fn add_pending(&self, id: u64) {
        let mut pending = self.lock_pending();
        pending.ids.insert(id);
        pending.observed = false;
    }

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn len(&self) -> Result<usize> {
        self.transaction(true, |tx| Ok(tx.len()))
    }

    /// True when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// Occupancy snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn stats(&self) -> Result<BufferStats> {
        self.transaction(true, |tx| {
            let view = tx.view();
            Ok(BufferStats {
                records: view.records.len(),
                observed: view
                    .records
                    .values()
                    .filter(|r| r.priority == Priority::Observed)
                    .count(),
                payload_bytes: view.payload_bytes(),
                oldest_created_at: view.records.values().map(|r| r.created_at).min(),
            })
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingSet> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

/// Operations available inside [`Buffer::transaction`].
///
/// Writes change the store directly, so a block observes its own writes.
/// Each one is logged for undo; dropping an uncommitted transaction reverts
/// them in reverse order.
pub struct Transaction<'a> {
    store: Access<'a>,
    journal: Vec<JournalOp>,
    undo: Vec<Undo>,
}

enum Access<'a> {
    Shared(&'a StoreData),
    Exclusive(&'a mut StoreData),
}

/// Inverse of one change.
enum Undo {
    Insert { id: u64, next_id: u64 },
    Delete(SpanRecord),
    Priority { id: u64, priority: Priority },
    Destination(Destination),
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let Access::Exclusive(store) = &mut self.store else {
            return;
        };
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Insert { id, next_id } => {
                    store.records.remove(&id);
                    store.next_id = next_id;
                }
                Undo::Delete(record) => {
                    store.records.insert(record.id, record);
                }
                Undo::Priority { id, priority } => {
                    if let Some(record) = store.records.get_mut(&id) {
                        record.priority = priority;
                    }
                }
                Undo::Destination(destination) => store.destination = destination,
            }
        }
    }
}

impl<'a> Transaction<'a> {
    const fn shared(store: &'a StoreData) -> Self {
        Self {
            store: Access::Shared(store),
            journal: Vec::new(),
            undo: Vec::new(),
        }
    }

    fn exclusive(store: &'a mut StoreData) -> Self {
        Self {
            store: Access::Exclusive(store),
            journal: Vec::new(),
            undo: Vec::new(),
        }
    }

    fn commit(&mut self) {
        self.undo.clear();
        self.journal.clear();
    }

    fn view(&self) -> &StoreData {
        match &self.store {
            Access::Shared(store) => *store,
            Access::Exclusive(store) => &**store,
        }
    }

    fn stage(&mut self) -> Result<&mut StoreData> {
        match &mut self.store {
            Access::Shared(_) => Err(SpoolError::ReadOnly),
            Access::Exclusive(store) => Ok(&mut **store),
        }
    }

    /// Whether this transaction rejects writes.
    #[must_use]
    pub const fn is_readonly(&self) -> bool {
        matches!(self.store, Access::Shared(_))
    }

    /// Looks up a record by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&SpanRecord> {
        self.view().records.get(&id)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.view().records.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.view().records.is_empty()
    }

    /// All records in id order.
    pub fn records(&self) -> impl Iterator<Item = &SpanRecord> {
        self.view().records.values()
    }

    /// Ids sorted by priority, then id.
    #[must_use]
    pub fn drain_order(&self) -> Vec<u64> {
        let mut keys: Vec<(Priority, u64)> =
            self.view().records.values().map(SpanRecord::drain_key).collect();
        keys.sort_unstable();
        keys.into_iter().map(|(_, id)| id).collect()
    }

    /// Stored destination.
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.view().destination
    }

    /// Inserts a fresh record under the next id.
    ///
    /// # Errors
    ///
    /// Fails in a read-only transaction.
    pub fn insert(&mut self, data: Vec<u8>, mime: &str) -> Result<u64> {
        let store = self.stage()?;
        let id = store.next_id;
        store.next_id = id
            .checked_add(1)
            .ok_or_else(|| SpoolError::Storage("record id space exhausted".to_string()))?;
        let record = SpanRecord::new(id, data, mime);
        store.records.insert(id, record.clone());

        self.undo.push(Undo::Insert { id, next_id: id });
        self.journal.push(JournalOp::Insert { record });
        Ok(id)
    }

    /// Removes a record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Fails in a read-only transaction.
    pub fn delete(&mut self, id: u64) -> Result<bool> {
        if self.get(id).is_none() {
            return Ok(false);
        }
        let Some(record) = self.stage()?.records.remove(&id) else {
            return Ok(false);
        };

        self.undo.push(Undo::Delete(record));
        self.journal.push(JournalOp::Delete { id });
        Ok(true)
    }

    /// Changes a record's priority. Returns whether anything changed.
    ///
    /// Missing ids and records already at `priority` leave the transaction
    /// clean.
    ///
    /// # Errors
    ///
    /// Fails in a read-only transaction.
    pub fn set_priority(&mut self, id: u64, priority: Priority) -> Result<bool> {
        match self.get(id) {
            Some(record) if record.priority != priority => {}
            _ => return Ok(false),
        }
        let Some(record) = self.stage()?.records.get_mut(&id) else {
            return Ok(false);
        };
        let previous = std::mem::replace(&mut record.priority, priority);

        self.undo.push(Undo::Priority { id, priority: previous });
        self.journal.push(JournalOp::Priority { id, priority });
        Ok(true)
    }

    /// Replaces the stored destination. Setting the current value again is a
    /// no-op that writes nothing.
    ///
    /// # Errors
    ///
    /// Fails in a read-only transaction.
    pub fn set_destination(&mut self, destination: Destination) -> Result<()> {
        let store = self.stage()?;
        if store.destination == destination {
            return Ok(());
        }
        let previous = std::mem::replace(&mut store.destination, destination.clone());

        self.undo.push(Undo::Destination(previous));
        self.journal.push(JournalOp::Destination { destination });
        Ok(())
    }

    /// Evicts records until payload bytes fit in `max_bytes`, sparing `keep`.
    fn evict_over(&mut self, max_bytes: u64, keep: u64) -> Result<Vec<u64>> {
        let mut total = self.view().payload_bytes();
        if total <= max_bytes {
            return Ok(Vec::new());
        }

        let mut victims: Vec<(std::cmp::Reverse<Priority>, u64, u64)> = self
            .view()
            .records
            .values()
            .filter(|r| r.id != keep)
            .map(|r| (std::cmp::Reverse(r.priority), r.id, r.data.len() as u64))
            .collect();
        victims.sort_unstable();

        let mut evicted = Vec::new();
        for (_, id, size) in victims {
            if total <= max_bytes {
                break;
            }
            self.delete(id)?;
            total = total.saturating_sub(size);
            evicted.push(id);
        }
        Ok(evicted)
    }
}

/// Drain-order walk over the buffer, created by [`Buffer::iter`].
pub struct PendingIter<'a> {
    buffer: &'a Buffer,
    order: std::vec::IntoIter<u64>,
}

impl PendingIter<'_> {
    /// Rescans storage and starts over from the most urgent record.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub fn restart(&mut self) -> Result<()> {
        self.order = self
            .buffer
            .transaction(true, |tx| Ok(tx.drain_order()))?
            .into_iter();
        Ok(())
    }
}

impl Iterator for PendingIter<'_> {
    type Item = Result<SpanRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.order.next()?;
            match self.buffer.transaction(true, |tx| Ok(tx.get(id).cloned())) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
