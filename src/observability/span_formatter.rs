//! OTLP JSON encoding of finished spans.
//!
//! Produces one `ExportTraceServiceRequest` document per batch, in the JSON
//! mapping collectors accept on `/v1/traces` with
//! `Content-Type: application/json`.

use opentelemetry::trace::{Event, Link, SpanId, SpanKind, Status};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::resource::Resource;
use serde_json::{json, Value as JsonValue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Encodes span batches as OTLP JSON.
pub struct SpanFormatter {
    resource: Resource,
    scope: String,
}

impl SpanFormatter {
    /// Creates a formatter stamping every document with `resource` and the
    /// instrumentation scope name `scope`.
    pub fn new(resource: Resource, scope: impl Into<String>) -> Self {
        Self {
            resource,
            scope: scope.into(),
        }
    }

    /// Replaces the resource attached to later batches.
    pub fn set_resource(&mut self, resource: Resource) {
        self.resource = resource;
    }

    /// Encodes `batch` as a complete request document.
    ///
    /// ```json
    /// {
    ///   "resourceSpans": [{
    ///     "resource": { "attributes": [{"key": "service.name", "value": {"stringValue": "app"}}] },
    ///     "scopeSpans": [{ "scope": {"name": "trace-spool"}, "spans": [...] }]
    ///   }]
    /// }
    /// ```
    pub fn format_batch(&self, batch: &[SpanData]) -> JsonValue {
        let resource_attrs: Vec<JsonValue> = self
            .resource
            .iter()
            .map(|(key, value)| json!({ "key": key.as_str(), "value": any_value(value) }))
            .collect();

        json!({
            "resourceSpans": [{
                "resource": { "attributes": resource_attrs },
                "scopeSpans": [{
                    "scope": { "name": self.scope },
                    "spans": batch.iter().map(format_span).collect::<Vec<_>>(),
                }]
            }]
        })
    }

    /// Encodes `batch` straight to bytes.
    pub fn encode(&self, batch: &[SpanData]) -> Vec<u8> {
        self.format_batch(batch).to_string().into_bytes()
    }
}

fn format_span(span: &SpanData) -> JsonValue {
    let (status_code, status_message) = status(&span.status);
    let parent = if span.parent_span_id == SpanId::INVALID {
        String::new()
    } else {
        format!("{:016x}", span.parent_span_id)
    };

    json!({
        "traceId": format!("{:032x}", span.span_context.trace_id()),
        "spanId": format!("{:016x}", span.span_context.span_id()),
        "parentSpanId": parent,
        "name": span.name,
        "kind": kind(&span.span_kind),
        "startTimeUnixNano": unix_nanos(span.start_time),
        "endTimeUnixNano": unix_nanos(span.end_time),
        "attributes": attributes(&span.attributes),
        "droppedAttributesCount": span.dropped_attributes_count,
        "events": span.events.iter().map(event).collect::<Vec<_>>(),
        "links": span.links.iter().map(link).collect::<Vec<_>>(),
        "status": { "code": status_code, "message": status_message },
    })
}

/// OTLP `SpanKind` numbering; 0 is reserved for unspecified.
const fn kind(kind: &SpanKind) -> u8 {
    match kind {
        SpanKind::Internal => 1,
        SpanKind::Server => 2,
        SpanKind::Client => 3,
        SpanKind::Producer => 4,
        SpanKind::Consumer => 5,
    }
}

fn status(status: &Status) -> (u8, String) {
    match status {
        Status::Unset => (0, String::new()),
        Status::Ok => (1, String::new()),
        Status::Error { description } => (2, description.to_string()),
    }
}

/// 64-bit integers are strings in OTLP JSON.
fn unix_nanos(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos()
        .to_string()
}

fn attributes(attributes: &[KeyValue]) -> Vec<JsonValue> {
    attributes
        .iter()
        .map(|kv| json!({ "key": kv.key.as_str(), "value": any_value(&kv.value) }))
        .collect()
}

fn any_value(value: &Value) -> JsonValue {
    match value {
        Value::Bool(b) => json!({ "boolValue": b }),
        Value::I64(i) => json!({ "intValue": i.to_string() }),
        Value::F64(f) => json!({ "doubleValue": f }),
        Value::String(s) => json!({ "stringValue": s.as_str() }),
        Value::Array(_) => json!({ "stringValue": value.to_string() }),
    }
}

fn event(event: &Event) -> JsonValue {
    json!({
        "timeUnixNano": unix_nanos(event.timestamp),
        "name": event.name,
        "attributes": attributes(&event.attributes),
    })
}

fn link(link: &Link) -> JsonValue {
    json!({
        "traceId": format!("{:032x}", link.span_context.trace_id()),
        "spanId": format!("{:016x}", link.span_context.span_id()),
        "attributes": attributes(&link.attributes),
    })
}

impl std::fmt::Debug for SpanFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanFormatter")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
