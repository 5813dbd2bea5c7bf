//! Delivery of encoded batches to the collector.
//!
//! [`Transport`] is the seam between the drain loop and the network. The
//! production implementation, [`HttpTransport`], POSTs each batch to the
//! configured OTLP/HTTP endpoint with a blocking `reqwest` client. The
//! exporter runs on its own thread and calls it with no buffer lock held.

use crate::domain::{DeliveryError, Destination};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

/// Longest response body kept in a rejection error.
const MAX_ERROR_BODY: usize = 512;

/// Sends one encoded batch to a destination.
pub trait Transport: Send {
    /// Delivers `body` to `destination` with content type `mime`.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] when the collector could not be reached or
    /// did not acknowledge the batch with a 2xx status.
    fn send(&mut self, destination: &Destination, mime: &str, body: Vec<u8>)
        -> Result<(), DeliveryError>;

    /// Name used in log output.
    fn name(&self) -> &str;
}

/// OTLP/HTTP transport over `reqwest`.
///
/// The client is rebuilt whenever the destination's certificate material
/// changes, so a reconfigured CA takes effect on the next send.
pub struct HttpTransport {
    timeout: Duration,
    client: Option<(Option<String>, reqwest::blocking::Client)>,
}

impl HttpTransport {
    /// Creates a transport with no client yet.
    ///
    /// # Parameters
    ///
    /// - `timeout`: whole-request limit, connect included; a request past it
    ///   fails with [`DeliveryError::Timeout`]
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: None,
        }
    }

    fn client_for(&mut self, ca: Option<&str>) -> Result<&reqwest::blocking::Client, DeliveryError> {
        let stale = match &self.client {
            Some((cached_ca, _)) => cached_ca.as_deref() != ca,
            None => true,
        };

        if stale {
            let mut builder = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .user_agent(concat!("trace-spool/", env!("CARGO_PKG_VERSION")));

            if let Some(pem) = ca {
                let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                    .map_err(|e| DeliveryError::Certificate(e.to_string()))?;
                builder = builder.add_root_certificate(cert);
            }

            let client = builder
                .build()
                .map_err(|e| DeliveryError::Certificate(e.to_string()))?;
            tracing::debug!(custom_ca = ca.is_some(), "http client built");
            self.client = Some((ca.map(str::to_string), client));
        }

        self.client
            .as_ref()
            .map(|(_, client)| client)
            .ok_or_else(|| DeliveryError::Network("http client unavailable".to_string()))
    }
}

impl Transport for HttpTransport {
    fn send(
        &mut self,
        destination: &Destination,
        mime: &str,
        body: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let url = destination
            .url()
            .ok_or_else(|| DeliveryError::Network("no destination configured".to_string()))?
            .to_string();
        let client = self.client_for(destination.ca())?;

        let response = client
            .post(&url)
            .header(CONTENT_TYPE, mime)
            .body(body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut text = response.text().unwrap_or_default();
        if text.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body: text,
        })
    }

    fn name(&self) -> &str {
        "otlp-http"
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Transport double that records every request and can be told to fail.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: std::sync::Arc<std::sync::Mutex<Recorded>>,
}

#[cfg(test)]
#[derive(Default)]
struct Recorded {
    sent: Vec<(String, String, Vec<u8>)>,
    failing: bool,
    attempts: usize,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    /// Successful requests as `(url, mime, body)`.
    pub fn sent(&self) -> Vec<(String, String, Vec<u8>)> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    fn send(
        &mut self,
        destination: &Destination,
        mime: &str,
        body: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts += 1;
        if inner.failing {
            return Err(DeliveryError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let url = destination.url().unwrap_or_default().to_string();
        inner.sent.push((url, mime.to_string(), body));
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn destination(url: &str) -> Destination {
        Destination::new(Some(url), None).unwrap()
    }

    #[test]
    fn posts_body_with_content_type() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/traces")
                .header("content-type", "application/x-protobuf")
                .body("payload");
            then.status(200);
        });

        let mut transport = HttpTransport::new(Duration::from_secs(5));
        transport
            .send(
                &destination(&server.url("/v1/traces")),
                "application/x-protobuf",
                b"payload".to_vec(),
            )
            .unwrap();

        mock.assert();
    }

    #[test]
    fn non_success_status_is_rejection() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/traces");
            then.status(500).body("collector overloaded");
        });

        let mut transport = HttpTransport::new(Duration::from_secs(5));
        let err = transport
            .send(&destination(&server.url("/v1/traces")), "application/json", b"{}".to_vec())
            .unwrap_err();

        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "collector overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unreachable_collector_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = HttpTransport::new(Duration::from_secs(2));
        let err = transport
            .send(
                &destination(&format!("http://127.0.0.1:{port}/v1/traces")),
                "application/json",
                Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Network(_) | DeliveryError::Timeout), "{err}");
    }

    #[test]
    fn bad_certificate_fails_delivery() {
        let dest = Destination::new(Some("https://127.0.0.1:9/v1/traces"), Some("not a pem")).unwrap();
        let mut transport = HttpTransport::new(Duration::from_secs(1));

        let err = transport.send(&dest, "application/json", Vec::new()).unwrap_err();
        assert!(matches!(err, DeliveryError::Certificate(_) | DeliveryError::Network(_)), "{err}");
    }
}
