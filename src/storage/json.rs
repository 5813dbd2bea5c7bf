//! JSON file storage backend.
//!
//! The store lives in two files next to each other:
//!
//! - the snapshot at the configured path, one human-readable JSON document,
//!   replaced by writing a temporary sibling, flushing it and renaming it
//!   over the original;
//! - the journal at `<path>.journal`, one JSON array of [`JournalOp`]s per
//!   committed transaction, appended and flushed on every commit.
//!
//! A commit costs one small append regardless of how much is buffered. The
//! buffer folds the journal into a new snapshot once it has grown past the
//! size of the live data. A crash leaves either the old or the new snapshot,
//! never a torn one, and a line cut short by a crash is an uncommitted
//! transaction that is dropped on load.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "next_id": 4,
//!   "destination": { "url": "https://collector:4318/v1/traces", "ca": null },
//!   "records": [
//!     { "id": 3, "priority": 10, "data": "CgQ=", "mime": "application/x-protobuf", "created_at": 1760000000 }
//!   ]
//! }
//! ```

use crate::domain::error::{Result, SpoolError};
use crate::storage::backend::Storage;
use crate::storage::models::{JournalOp, StoreData, STORE_VERSION};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Suffix of the file a new snapshot is written to before the rename.
pub const TMP_SUFFIX: &str = ".tmp";

/// Suffix of the journal file.
pub const JOURNAL_SUFFIX: &str = ".journal";

/// `path` with `suffix` appended to its full file name.
///
/// `buffer.json` becomes `buffer.json.tmp`, so the result never equals
/// `path` and two stores in one directory never share a sibling.
#[must_use]
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// JSON file storage backend.
pub struct JsonStorage {
    /// Path to the snapshot on disk.
    file_path: PathBuf,
    /// Path to the journal on disk.
    journal_path: PathBuf,
    /// Journal size, including any torn tail found at load.
    journal_len: AtomicU64,
}

impl JsonStorage {
    /// Opens a JSON store at `file_path`, creating parent directories.
    ///
    /// A missing snapshot is created empty so that permission problems
    /// surface at startup rather than on the first enqueue.
    ///
    /// # Parameters
    ///
    /// - `file_path`: location of the snapshot; the journal and temporary
    ///   files sit next to it
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or the initial file cannot
    /// be created.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use trace_spool::storage::{JsonStorage, Storage};
    /// use std::path::PathBuf;
    ///
    /// let storage = JsonStorage::new(PathBuf::from("/tmp/spans.json"))?;
    /// let data = storage.load()?;
    /// # Ok::<(), trace_spool::SpoolError>(())
    /// ```
    pub fn new(file_path: PathBuf) -> Result<Self> {
        tracing::debug!(path = ?file_path, "initializing JSON storage");

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let storage = Self {
            journal_path: sibling_path(&file_path, JOURNAL_SUFFIX),
            file_path,
            journal_len: AtomicU64::new(0),
        };
        if !storage.file_path.exists() {
            tracing::debug!("initializing new empty store");
            storage.write_snapshot(&StoreData::default())?;
        }

        Ok(storage)
    }

    /// Location of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Location of the journal file.
    #[must_use]
    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    fn corrupt(&self, reason: impl Into<String>) -> SpoolError {
        SpoolError::Corrupt {
            path: self.file_path.clone(),
            reason: reason.into(),
        }
    }

    fn load_snapshot(&self) -> Result<StoreData> {
        if !self.file_path.exists() {
            tracing::debug!("store file missing, starting empty");
            return Ok(StoreData::default());
        }

        let contents = fs::read_to_string(&self.file_path)?;
        let data: StoreData =
            serde_json::from_str(&contents).map_err(|e| self.corrupt(e.to_string()))?;

        if data.version > STORE_VERSION {
            return Err(self.corrupt(format!(
                "store version {} is newer than supported {STORE_VERSION}",
                data.version
            )));
        }
        Ok(data)
    }

    /// Replays complete journal lines onto `data`.
    ///
    /// # Returns
    ///
    /// The number of transactions replayed.
    fn replay_journal(&self, data: &mut StoreData) -> Result<usize> {
        let contents = match fs::read(&self.journal_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.journal_len.store(0, Ordering::SeqCst);
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        self.journal_len.store(contents.len() as u64, Ordering::SeqCst);

        let mut replayed = 0usize;
        for line in contents.split_inclusive(|b| *b == b'\n') {
            if !line.ends_with(b"\n") {
                tracing::warn!(
                    bytes = line.len(),
                    "dropping incomplete journal entry left by a crash"
                );
                break;
            }
            let ops: Vec<JournalOp> = serde_json::from_slice(line).map_err(|e| {
                self.corrupt(format!("journal entry {}: {e}", replayed + 1))
            })?;
            for op in ops {
                data.apply(op);
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    fn write_snapshot(&self, data: &StoreData) -> Result<()> {
        let json = serde_json::to_vec(data)
            .map_err(|e| SpoolError::Storage(format!("failed to serialize store: {e}")))?;

        let tmp_path = sibling_path(&self.file_path, TMP_SUFFIX);
        tracing::trace!(tmp_path = ?tmp_path, bytes = json.len(), "writing temporary store");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.file_path)?;
        sync_parent_dir(&self.file_path);
        Ok(())
    }
}

impl Storage for JsonStorage {
    fn load(&self) -> Result<StoreData> {
        let _span = tracing::debug_span!("json_load", path = ?self.file_path).entered();

        let mut data = self.load_snapshot()?;
        let replayed = self.replay_journal(&mut data)?;
        data.reconcile_next_id();

        tracing::debug!(
            records = data.records.len(),
            next_id = data.next_id,
            replayed,
            "loaded store"
        );
        Ok(data)
    }

    fn append(&self, ops: &[JournalOp]) -> Result<()> {
        let mut line = serde_json::to_vec(ops)
            .map_err(|e| SpoolError::Storage(format!("failed to serialize journal: {e}")))?;
        line.push(b'\n');

        let created = !self.journal_path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        if created {
            sync_parent_dir(&self.journal_path);
        }

        self.journal_len.fetch_add(line.len() as u64, Ordering::SeqCst);
        tracing::trace!(ops = ops.len(), bytes = line.len(), "journal appended");
        Ok(())
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        self.write_snapshot(data)?;

        // Replaying a stale journal over the new snapshot is harmless, so a
        // crash before this point loses nothing.
        match fs::remove_file(&self.journal_path) {
            Ok(()) => sync_parent_dir(&self.journal_path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.journal_len.store(0, Ordering::SeqCst);

        tracing::trace!(records = data.records.len(), "store persisted");
        Ok(())
    }

    fn journal_bytes(&self) -> u64 {
        self.journal_len.load(Ordering::SeqCst)
    }
}

/// Flushes the directory entry so the rename itself is durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::debug!(error = %e, "directory sync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

impl std::fmt::Debug for JsonStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStorage")
            .field("file_path", &self.file_path)
            .field("journal_bytes", &self.journal_bytes())
            .finish()
    }
}
