//! On-disk documents for the buffer.
//!
//! The snapshot is one JSON document. Records are kept in a `BTreeMap`
//! keyed by id in memory and written out as a list, so the file stays
//! readable and ids never need string-keyed maps.
//!
//! Commits between snapshots are journaled as [`JournalOp`] lists, one JSON
//! array per line. Every op sets its key outright, so replaying a journal
//! over a snapshot that already contains some of it gives the same store.

use crate::domain::{Destination, Priority, SpanRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current store format version.
pub const STORE_VERSION: u32 = 1;

/// Complete persisted state of the buffer.
///
/// Both the pending records and the destination live here, so delivery
/// resumes after a restart with no further configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
    /// Format version for future migrations.
    pub version: u32,

    /// Next identifier to hand out.
    pub next_id: u64,

    /// Configured collector.
    #[serde(default)]
    pub destination: Destination,

    /// Pending records, indexed by id.
    #[serde(default, with = "record_list")]
    pub records: BTreeMap<u64, SpanRecord>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            next_id: 1,
            destination: Destination::disabled(),
            records: BTreeMap::new(),
        }
    }
}

impl StoreData {
    /// Brings `next_id` above every stored id.
    ///
    /// Guards against a file whose counter lags its records (hand edits, or a
    /// file written by an older format) so a fresh id can never collide.
    pub fn reconcile_next_id(&mut self) {
        if let Some(max) = self.records.keys().next_back() {
            self.next_id = self.next_id.max(max.saturating_add(1));
        }
        self.next_id = self.next_id.max(1);
    }

    /// Sum of payload sizes.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.records.values().map(|r| r.data.len() as u64).sum()
    }

    /// Replays one journaled change.
    pub fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::Insert { record } => {
                self.next_id = self.next_id.max(record.id.saturating_add(1));
                self.records.insert(record.id, record);
            }
            JournalOp::Delete { id } => {
                self.records.remove(&id);
            }
            JournalOp::Priority { id, priority } => {
                if let Some(record) = self.records.get_mut(&id) {
                    record.priority = priority;
                }
            }
            JournalOp::Destination { destination } => self.destination = destination,
        }
    }
}

/// One change recorded in the journal.
///
/// ```json
/// [{"op":"insert","record":{"id":7,"priority":10,"data":"CgA=","mime":"application/x-protobuf","created_at":1760000000}},{"op":"delete","id":3}]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    /// A new record.
    Insert { record: SpanRecord },
    /// A record removed after delivery or eviction.
    Delete { id: u64 },
    /// A priority transition.
    Priority { id: u64, priority: Priority },
    /// A new destination.
    Destination { destination: Destination },
}

mod record_list {
    use crate::domain::SpanRecord;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        records: &BTreeMap<u64, SpanRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(records.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u64, SpanRecord>, D::Error> {
        let list = Vec::<SpanRecord>::deserialize(deserializer)?;
        let mut records = BTreeMap::new();
        for record in list {
            if records.insert(record.id, record).is_some() {
                return Err(serde::de::Error::custom("duplicate record id"));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_id_is_raised_past_existing_records() {
        let mut data = StoreData::default();
        data.records.insert(41, SpanRecord::new(41, vec![1], "a"));
        data.next_id = 3;

        data.reconcile_next_id();
        assert_eq!(data.next_id, 42);
    }

    #[test]
    fn duplicate_ids_fail_to_load() {
        let json = r#"{
            "version": 1,
            "next_id": 5,
            "records": [
                {"id": 2, "priority": 10, "data": "", "mime": "a", "created_at": 0},
                {"id": 2, "priority": 0, "data": "", "mime": "a", "created_at": 0}
            ]
        }"#;
        assert!(serde_json::from_str::<StoreData>(json).is_err());
    }

    #[test]
    fn replaying_a_journal_twice_changes_nothing() {
        let ops = vec![
            JournalOp::Insert { record: SpanRecord::new(5, vec![1], "a") },
            JournalOp::Priority { id: 5, priority: Priority::Observed },
            JournalOp::Insert { record: SpanRecord::new(6, vec![2], "a") },
            JournalOp::Delete { id: 6 },
            JournalOp::Priority { id: 6, priority: Priority::Observed },
        ];

        let mut once = StoreData::default();
        for op in ops.clone() {
            once.apply(op);
        }
        let mut twice = once.clone();
        for op in ops {
            twice.apply(op);
        }

        assert_eq!(once, twice);
        assert_eq!(once.next_id, 7);
        assert_eq!(once.records.len(), 1);
        assert_eq!(once.records[&5].priority, Priority::Observed);
    }

    #[test]
    fn journal_ops_are_tagged() {
        let line = serde_json::to_string(&[JournalOp::Delete { id: 3 }]).unwrap();
        assert_eq!(line, r#"[{"op":"delete","id":3}]"#);
    }

    #[test]
    fn missing_sections_default() {
        let data: StoreData = serde_json::from_str(r#"{"version":1,"next_id":1}"#).unwrap();
        assert!(data.records.is_empty());
        assert!(data.destination.is_disabled());
    }
}
