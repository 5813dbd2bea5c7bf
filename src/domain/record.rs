//! Span records, the unit of storage in the buffer.

use serde::{Deserialize, Serialize};

/// Drain priority of a stored record. Lower values are exported first.
///
/// The set is closed: records are either fresh or have already been handed to
/// an export attempt. Observed records go first after a restart because they
/// are the ones most likely to have been interrupted mid-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// Handed to at least one export attempt.
    Observed,
    /// Enqueued and never yet attempted.
    Default,
}

impl Priority {
    /// Numeric value as persisted in the buffer file.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Observed => 0,
            Self::Default => 10,
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Observed),
            10 => Ok(Self::Default),
            other => Err(format!("unknown priority {other}")),
        }
    }
}

/// One buffered payload awaiting delivery.
///
/// `data` is opaque; `mime` says how to read it (for instance
/// `application/x-protobuf` or `application/json` OTLP requests).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Buffer-wide unique, monotonically assigned identifier.
    pub id: u64,

    /// Current drain priority.
    pub priority: Priority,

    /// Serialized span payload.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,

    /// Content type of `data`.
    pub mime: String,

    /// Unix timestamp (seconds) of the enqueue.
    pub created_at: i64,
}

impl SpanRecord {
    /// Creates a fresh record with [`Priority::Default`], stamped now.
    pub fn new(id: u64, data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            id,
            priority: Priority::Default,
            data,
            mime: mime.into(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Drain order key: priority first, then insertion order.
    #[must_use]
    pub fn drain_key(&self) -> (Priority, u64) {
        (self.priority, self.id)
    }
}

/// Payload bytes are kept as base64 text in the JSON store.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_sorts_before_default() {
        assert!(Priority::Observed < Priority::Default);
        assert!(Priority::Observed.value() < Priority::Default.value());
    }

    #[test]
    fn unknown_priority_is_rejected_on_load() {
        let json = r#"{"id":1,"priority":7,"data":"","mime":"x","created_at":0}"#;
        assert!(serde_json::from_str::<SpanRecord>(json).is_err());
    }

    #[test]
    fn payload_is_stored_as_base64() {
        let record = SpanRecord::new(3, vec![0, 159, 146, 150], "application/x-protobuf");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["data"], "AJ+Slg==");
        assert_eq!(json["priority"], 10);

        let back: SpanRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
