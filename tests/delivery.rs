//! End-to-end delivery against a mock OTLP/HTTP collector.

use httpmock::prelude::*;
use std::path::Path;
use std::time::Duration;
use trace_spool::{Backend, BackendConfig, DrainOutcome, RetryConfig, MIME_JSON, MIME_PROTOBUF};

const WAIT: Duration = Duration::from_secs(10);

/// Only explicit flushes and wake-ups drive delivery in these tests.
fn config(dir: &Path) -> BackendConfig {
    BackendConfig {
        buffer_path: dir.join("buffer.json"),
        drain_interval: Duration::from_secs(3600),
        send_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
        },
        ..BackendConfig::default()
    }
}

#[test]
fn buffered_records_reach_collector() {
    let server = MockServer::start();
    let collector = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/traces")
            .header("content-type", MIME_PROTOBUF)
            .body("abc");
        then.status(200);
    });

    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::start(config(dir.path())).unwrap();
    for payload in ["a", "b", "c"] {
        backend.emit(payload, MIME_PROTOBUF).unwrap();
    }

    backend
        .set_destination(Some(&server.url("/v1/traces")), None)
        .unwrap();
    assert!(matches!(backend.flush(WAIT).unwrap(), DrainOutcome::Delivered(_)));

    collector.assert_hits(1);
    assert!(backend.buffer().is_empty().unwrap());
    backend.shutdown(WAIT).unwrap();
}

#[test]
fn records_and_destination_survive_restart() {
    let server = MockServer::start();
    let collector = server.mock(|when, then| {
        when.method(POST).path("/v1/traces").body("xyz");
        then.status(200);
    });

    let dir = tempfile::tempdir().unwrap();
    {
        let backend = Backend::start(config(dir.path())).unwrap();
        for payload in ["x", "y", "z"] {
            backend.emit(payload, MIME_PROTOBUF).unwrap();
        }
        assert_eq!(backend.shutdown(WAIT).unwrap(), DrainOutcome::Disabled { delivered: 0 });
    }

    {
        let backend = Backend::start(config(dir.path())).unwrap();
        assert_eq!(backend.stats().unwrap().records, 3);
        backend
            .set_destination(Some(&server.url("/v1/traces")), None)
            .unwrap();
        assert_eq!(backend.flush(WAIT).unwrap(), DrainOutcome::Delivered(0));
        // Dropped without a final flush.
    }

    collector.assert_hits(1);

    let backend = Backend::start(config(dir.path())).unwrap();
    assert_eq!(
        backend.get_destination().unwrap().url(),
        Some(server.url("/v1/traces").as_str())
    );
    assert_eq!(backend.stats().unwrap().records, 0);
}

#[test]
fn outage_keeps_records_until_collector_recovers() {
    let server = MockServer::start();
    let mut outage = server.mock(|when, then| {
        when.method(POST).path("/v1/traces");
        then.status(503).body("try later");
    });

    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::start(config(dir.path())).unwrap();
    backend.emit("payload", MIME_PROTOBUF).unwrap();
    backend
        .set_destination(Some(&server.url("/v1/traces")), None)
        .unwrap();

    assert_eq!(
        backend.flush(WAIT).unwrap(),
        DrainOutcome::Deferred {
            delivered: 0,
            remaining: 1
        }
    );
    let stats = backend.stats().unwrap();
    assert_eq!(stats.records, 1);
    assert_eq!(stats.observed, 1);

    outage.delete();
    let recovered = server.mock(|when, then| {
        when.method(POST).path("/v1/traces").body("payload");
        then.status(200);
    });

    assert_eq!(backend.flush(WAIT).unwrap(), DrainOutcome::Delivered(1));
    recovered.assert_hits(1);
    assert!(backend.buffer().is_empty().unwrap());
}

#[test]
fn json_requests_are_merged() {
    let server = MockServer::start();
    let collector = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/traces")
            .header("content-type", MIME_JSON)
            .body_contains("\"first\"")
            .body_contains("\"second\"");
        then.status(200);
    });

    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::start(config(dir.path())).unwrap();
    for name in ["first", "second"] {
        let doc = format!(r#"{{"resourceSpans":[{{"scopeSpans":[{{"spans":[{{"name":"{name}"}}]}}]}}]}}"#);
        backend.emit(doc, MIME_JSON).unwrap();
    }

    backend
        .set_destination(Some(&server.url("/v1/traces")), None)
        .unwrap();
    backend.flush(WAIT).unwrap();

    collector.assert_hits(1);
    assert!(backend.buffer().is_empty().unwrap());
}

#[test]
fn cleared_destination_pauses_delivery() {
    let server = MockServer::start();
    let collector = server.mock(|when, then| {
        when.method(POST).path("/v1/traces");
        then.status(200);
    });

    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::start(config(dir.path())).unwrap();
    backend
        .set_destination(Some(&server.url("/v1/traces")), None)
        .unwrap();
    backend.flush(WAIT).unwrap();
    backend.set_destination(None, None).unwrap();

    backend.emit("kept", MIME_PROTOBUF).unwrap();
    assert_eq!(backend.flush(WAIT).unwrap(), DrainOutcome::Disabled { delivered: 0 });
    assert_eq!(backend.stats().unwrap().records, 1);
    collector.assert_hits(0);
}
