//! Grouping of buffered records into requests.
//!
//! Each record is already a complete export request. Whether several of them
//! can share one POST depends on the payload encoding:
//!
//! - `application/x-protobuf`: serialized protobuf messages merge by
//!   concatenation (repeated `resource_spans` fields append).
//! - `application/json`: OTLP JSON documents merge by concatenating their
//!   `resourceSpans` arrays.
//! - anything else is opaque and travels alone.

use crate::domain::SpanRecord;
use serde_json::Value as JsonValue;

/// OTLP protobuf content type.
pub const MIME_PROTOBUF: &str = "application/x-protobuf";

/// OTLP JSON content type.
pub const MIME_JSON: &str = "application/json";

/// Encoded request ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Content type of `body`.
    pub mime: String,
    /// Records covered by this request, acknowledged together.
    pub ids: Vec<u64>,
    /// Request body.
    pub body: Vec<u8>,
}

enum Fit {
    Protobuf,
    Json(JsonValue),
    Opaque,
    No,
}

enum Parts {
    Empty,
    Protobuf(Vec<u8>),
    Json(Vec<JsonValue>),
    Opaque(String, Vec<u8>),
}

/// Accumulates records of one content type into a [`Batch`].
pub struct BatchBuilder {
    max_records: usize,
    ids: Vec<u64>,
    parts: Parts,
}

impl BatchBuilder {
    /// Starts an empty batch holding at most `max_records` records.
    #[must_use]
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            ids: Vec::new(),
            parts: Parts::Empty,
        }
    }

    /// True when nothing has been added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True while another compatible record may still be added.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.ids.len() < self.max_records && !matches!(self.parts, Parts::Opaque(..))
    }

    /// Adds `record` if it can share this request, otherwise hands it back.
    ///
    /// # Parameters
    ///
    /// - `record`: next record in drain order
    ///
    /// # Returns
    ///
    /// `Ok(())` once the record's payload is part of the batch.
    ///
    /// # Errors
    ///
    /// Returns the record unchanged when the batch is full or the record's
    /// encoding cannot be merged with what is already here.
    pub fn push(&mut self, record: SpanRecord) -> Result<(), SpanRecord> {
        if !self.has_room() {
            return Err(record);
        }

        let id = record.id;
        match self.fit(&record) {
            Fit::No => return Err(record),
            Fit::Protobuf => match &mut self.parts {
                Parts::Protobuf(body) => body.extend_from_slice(&record.data),
                _ => self.parts = Parts::Protobuf(record.data),
            },
            Fit::Json(doc) => match &mut self.parts {
                Parts::Json(docs) => docs.push(doc),
                _ => self.parts = Parts::Json(vec![doc]),
            },
            Fit::Opaque => self.parts = Parts::Opaque(record.mime, record.data),
        }

        self.ids.push(id);
        Ok(())
    }

    fn fit(&self, record: &SpanRecord) -> Fit {
        match (&self.parts, record.mime.as_str()) {
            (Parts::Empty | Parts::Protobuf(_), MIME_PROTOBUF) => Fit::Protobuf,
            (Parts::Empty | Parts::Json(_), MIME_JSON) => match mergeable_json(&record.data) {
                Some(doc) => Fit::Json(doc),
                None if self.is_empty() => Fit::Opaque,
                None => Fit::No,
            },
            (Parts::Empty, _) => Fit::Opaque,
            _ => Fit::No,
        }
    }

    /// Encodes the accumulated records.
    ///
    /// Returns `None` for an empty builder.
    #[must_use]
    pub fn finish(self) -> Option<Batch> {
        let (mime, body) = match self.parts {
            Parts::Empty => return None,
            Parts::Protobuf(body) => (MIME_PROTOBUF.to_string(), body),
            Parts::Json(docs) => (MIME_JSON.to_string(), merge_json(docs)),
            Parts::Opaque(mime, body) => (mime, body),
        };

        Some(Batch {
            mime,
            ids: self.ids,
            body,
        })
    }
}

fn mergeable_json(data: &[u8]) -> Option<JsonValue> {
    let doc: JsonValue = serde_json::from_slice(data).ok()?;
    doc.get("resourceSpans")?.as_array()?;
    Some(doc)
}

fn merge_json(docs: Vec<JsonValue>) -> Vec<u8> {
    let mut merged = Vec::new();
    for mut doc in docs {
        if let Some(JsonValue::Array(spans)) = doc.get_mut("resourceSpans").map(JsonValue::take) {
            merged.extend(spans);
        }
    }
    serde_json::json!({ "resourceSpans": merged }).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, data: &[u8], mime: &str) -> SpanRecord {
        SpanRecord::new(id, data.to_vec(), mime)
    }

    fn otlp_json(name: &str) -> Vec<u8> {
        serde_json::json!({
            "resourceSpans": [{ "scopeSpans": [{ "spans": [{ "name": name }] }] }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn protobuf_records_concatenate() {
        let mut builder = BatchBuilder::new(10);
        builder.push(record(1, b"\x0a\x01a", MIME_PROTOBUF)).unwrap();
        builder.push(record(2, b"\x0a\x01b", MIME_PROTOBUF)).unwrap();

        let batch = builder.finish().unwrap();
        assert_eq!(batch.ids, vec![1, 2]);
        assert_eq!(batch.body, b"\x0a\x01a\x0a\x01b");
        assert_eq!(batch.mime, MIME_PROTOBUF);
    }

    #[test]
    fn json_documents_merge_resource_spans() {
        let mut builder = BatchBuilder::new(10);
        builder.push(record(1, &otlp_json("a"), MIME_JSON)).unwrap();
        builder.push(record(2, &otlp_json("b"), MIME_JSON)).unwrap();

        let batch = builder.finish().unwrap();
        let doc: JsonValue = serde_json::from_slice(&batch.body).unwrap();
        let names: Vec<&str> = doc["resourceSpans"]
            .as_array()
            .unwrap()
            .iter()
            .map(|rs| rs["scopeSpans"][0]["spans"][0]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn mixed_content_types_split() {
        let mut builder = BatchBuilder::new(10);
        builder.push(record(1, b"x", MIME_PROTOBUF)).unwrap();

        let rejected = builder.push(record(2, &otlp_json("a"), MIME_JSON)).unwrap_err();
        assert_eq!(rejected.id, 2);
        assert_eq!(rejected.mime, MIME_JSON);
        assert_eq!(builder.finish().unwrap().ids, vec![1]);
    }

    #[test]
    fn opaque_and_malformed_json_travel_alone() {
        let mut builder = BatchBuilder::new(10);
        builder.push(record(1, b"plain", "text/plain")).unwrap();
        assert!(!builder.has_room());
        assert!(builder.push(record(2, b"plain", "text/plain")).is_err());

        let mut builder = BatchBuilder::new(10);
        builder.push(record(3, b"{not json", MIME_JSON)).unwrap();
        assert!(builder.push(record(4, &otlp_json("a"), MIME_JSON)).is_err());
        let batch = builder.finish().unwrap();
        assert_eq!(batch.body, b"{not json");
    }

    #[test]
    fn respects_record_limit() {
        let mut builder = BatchBuilder::new(2);
        builder.push(record(1, b"a", MIME_PROTOBUF)).unwrap();
        builder.push(record(2, b"b", MIME_PROTOBUF)).unwrap();
        assert!(builder.push(record(3, b"c", MIME_PROTOBUF)).is_err());
        assert!(BatchBuilder::new(2).finish().is_none());
    }
}
