//! Remote collector address.
//!
//! A [`Destination`] pairs an optional OTLP/HTTP endpoint with optional PEM
//! certificate material. An empty destination means "buffer only": spans keep
//! accumulating and the exporter stays idle until an endpoint is configured.

use crate::domain::error::{Result, SpoolError};
use serde::{Deserialize, Serialize};

/// URL schemes accepted for an export endpoint.
const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

/// Where buffered spans are delivered.
///
/// Construct through [`Destination::new`], which validates the URL scheme.
/// The value is persisted inside the buffer file, so a restarted process
/// resumes delivery without being reconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    url: Option<String>,
    ca: Option<String>,
}

impl Destination {
    /// Validates and builds a destination.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::InvalidDestination`] when `url` is set and does
    /// not parse, or its scheme is anything other than `http` or `https`.
    ///
    /// # Examples
    ///
    /// ```
    /// use trace_spool::Destination;
    ///
    /// assert!(Destination::new(Some("https://collector:4318/v1/traces"), None).is_ok());
    /// assert!(Destination::new(Some("file:///etc/passwd"), None).is_err());
    /// assert!(Destination::new(None, None).unwrap().is_disabled());
    /// ```
    pub fn new(url: Option<&str>, ca: Option<&str>) -> Result<Self> {
        if let Some(raw) = url {
            validate_url(raw)?;
        }

        Ok(Self {
            url: url.map(str::to_string),
            ca: ca.map(str::to_string),
        })
    }

    /// A destination with neither endpoint nor certificate.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { url: None, ca: None }
    }

    /// Endpoint URL, if export is enabled.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// PEM certificate material to trust for the endpoint.
    #[must_use]
    pub fn ca(&self) -> Option<&str> {
        self.ca.as_deref()
    }

    /// True when no endpoint is configured and draining is paused.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.url.is_none()
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| SpoolError::InvalidDestination(format!("{raw}: {e}")))?;

    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(SpoolError::InvalidDestination(format!(
            "unsupported scheme {:?} in {raw}",
            parsed.scheme()
        )));
    }

    if parsed.host_str().is_none() {
        return Err(SpoolError::InvalidDestination(format!("missing host in {raw}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        let plain = Destination::new(Some("http://a.com"), None).unwrap();
        assert_eq!(plain.url(), Some("http://a.com"));
        assert!(!plain.is_disabled());

        let tls = Destination::new(Some("https://a.com:4318/v1/traces"), Some("PEM")).unwrap();
        assert_eq!(tls.ca(), Some("PEM"));
    }

    #[test]
    fn rejects_other_schemes() {
        for bad in ["file:///etc/passwd", "gopher://aaa", "ftp://a.com", "not a url"] {
            let err = Destination::new(Some(bad), None).unwrap_err();
            assert!(matches!(err, SpoolError::InvalidDestination(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn none_is_disabled_but_may_keep_certificate() {
        let dest = Destination::new(None, Some("PEM")).unwrap();
        assert!(dest.is_disabled());
        assert_eq!(dest.ca(), Some("PEM"));
        assert_eq!(Destination::disabled(), Destination::default());
    }
}
