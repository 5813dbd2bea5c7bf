//! Backend configuration.
//!
//! [`BackendConfig`] can be built three ways: [`Default`], from a flat
//! string map (as handed over by a host process or environment), or from a
//! TOML file. Every key is optional and falls back to its default.

use crate::domain::error::{Result, SpoolError};
use crate::export::{ExporterConfig, RetryConfig};
use crate::infrastructure::paths;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default payload cap: 40 MiB.
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 40 * 1024 * 1024;

/// Default upper bound on records per request.
pub const DEFAULT_MAX_BATCH_RECORDS: usize = 64;

/// Settings for [`crate::Backend`].
///
/// # Example
///
/// ```toml
/// buffer_path = "/var/lib/myapp/spans.json"
/// max_buffer_bytes = 10485760
/// drain_interval_ms = 2000
/// max_batch_records = 32
/// send_timeout_ms = 5000
/// service_name = "myapp"
/// log_level = "debug"
///
/// [retry]
/// initial_delay = 250
/// max_delay = 30000
/// backoff_multiplier = 2.0
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Location of the buffer file.
    ///
    /// Default: `<data dir>/buffer.json`, see [`paths::get_data_dir`].
    pub buffer_path: PathBuf,

    /// Total payload bytes kept before the oldest records are evicted.
    ///
    /// Default: 40 MiB
    pub max_buffer_bytes: u64,

    /// Pause between drain cycles while deliveries succeed. Default: 1 s
    pub drain_interval: Duration,

    /// Upper bound on records per request. Default: 64
    pub max_batch_records: usize,

    /// Per-request timeout. Default: 10 s
    pub send_timeout: Duration,

    /// Backoff after failed drain cycles.
    pub retry: RetryConfig,

    /// `service.name` resource attribute for spans recorded through
    /// [`crate::observability::init_tracing`]. Default: `"trace-spool"`
    pub service_name: String,

    /// Log filter directive used when `RUST_LOG` is unset.
    ///
    /// Options: `trace`, `debug`, `info`, `warn`, `error`. Default: `"info"`
    pub log_level: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            buffer_path: paths::default_buffer_path(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            drain_interval: Duration::from_secs(1),
            max_batch_records: DEFAULT_MAX_BATCH_RECORDS,
            send_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            service_name: "trace-spool".to_string(),
            log_level: None,
        }
    }
}

/// File layout accepted by [`BackendConfig::from_toml_file`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    buffer_path: Option<PathBuf>,
    max_buffer_bytes: Option<u64>,
    drain_interval_ms: Option<u64>,
    max_batch_records: Option<usize>,
    send_timeout_ms: Option<u64>,
    retry: Option<RetryConfig>,
    service_name: Option<String>,
    log_level: Option<String>,
}

impl BackendConfig {
    /// Parses configuration from a string map.
    ///
    /// # Parsing Rules
    ///
    /// - `buffer_path`: path to the buffer file
    /// - `max_buffer_bytes`, `max_batch_records`: positive integers
    /// - `drain_interval_ms`, `send_timeout_ms`: milliseconds
    /// - `retry_initial_delay_ms`, `retry_max_delay_ms`: milliseconds
    /// - `retry_backoff_multiplier`: float, at least 1.0
    /// - `service_name`, `log_level`: strings
    ///
    /// Missing, empty or unparseable values keep their defaults.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::collections::BTreeMap;
    /// use std::time::Duration;
    /// use trace_spool::BackendConfig;
    ///
    /// let mut map = BTreeMap::new();
    /// map.insert("drain_interval_ms".to_string(), "250".to_string());
    /// map.insert("max_batch_records".to_string(), "not a number".to_string());
    ///
    /// let config = BackendConfig::from_map(&map);
    /// assert_eq!(config.drain_interval, Duration::from_millis(250));
    /// assert_eq!(config.max_batch_records, 64);
    /// ```
    #[must_use]
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let millis = |key: &str, fallback: Duration| {
            let fallback_ms = u64::try_from(fallback.as_millis()).unwrap_or(u64::MAX);
            parse_or(map, key, fallback_ms).map_or(fallback, Duration::from_millis)
        };

        let retry = RetryConfig {
            initial_delay: millis("retry_initial_delay_ms", defaults.retry.initial_delay),
            max_delay: millis("retry_max_delay_ms", defaults.retry.max_delay),
            backoff_multiplier: parse_or(
                map,
                "retry_backoff_multiplier",
                defaults.retry.backoff_multiplier,
            )
            .filter(|m| *m >= 1.0)
            .unwrap_or(defaults.retry.backoff_multiplier),
        };

        Self {
            buffer_path: text("buffer_path").map_or(defaults.buffer_path, PathBuf::from),
            max_buffer_bytes: parse_or(map, "max_buffer_bytes", defaults.max_buffer_bytes)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_buffer_bytes),
            drain_interval: millis("drain_interval_ms", defaults.drain_interval),
            max_batch_records: parse_or(map, "max_batch_records", defaults.max_batch_records)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_batch_records),
            send_timeout: millis("send_timeout_ms", defaults.send_timeout),
            retry,
            service_name: text("service_name").unwrap_or(defaults.service_name),
            log_level: text("log_level"),
        }
    }

    /// Loads configuration from a TOML file. Missing keys keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Config`] if the file cannot be read, is not valid
    /// TOML, has unknown keys, or sets a zero size limit.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SpoolError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Same as [`BackendConfig::from_toml_file`], minus the I/O failure.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| SpoolError::Config(e.to_string()))?;

        if file.max_buffer_bytes == Some(0) {
            return Err(SpoolError::Config("max_buffer_bytes must be positive".to_string()));
        }
        if file.max_batch_records == Some(0) {
            return Err(SpoolError::Config("max_batch_records must be positive".to_string()));
        }

        let defaults = Self::default();
        Ok(Self {
            buffer_path: file.buffer_path.unwrap_or(defaults.buffer_path),
            max_buffer_bytes: file.max_buffer_bytes.unwrap_or(defaults.max_buffer_bytes),
            drain_interval: file
                .drain_interval_ms
                .map_or(defaults.drain_interval, Duration::from_millis),
            max_batch_records: file.max_batch_records.unwrap_or(defaults.max_batch_records),
            send_timeout: file
                .send_timeout_ms
                .map_or(defaults.send_timeout, Duration::from_millis),
            retry: file.retry.unwrap_or(defaults.retry),
            service_name: file.service_name.unwrap_or(defaults.service_name),
            log_level: file.log_level,
        })
    }

    /// Drain loop settings derived from this configuration.
    #[must_use]
    pub fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            drain_interval: self.drain_interval,
            max_batch_records: self.max_batch_records,
            retry: self.retry.clone(),
        }
    }
}

/// `Some(parsed)` for a present, parseable value, `Some(fallback)` for a
/// missing one, `None` for garbage.
fn parse_or<T: FromStr>(map: &BTreeMap<String, String>, key: &str, fallback: T) -> Option<T> {
    let Some(raw) = map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Some(fallback);
    };
    let parsed = raw.parse::<T>().ok();
    if parsed.is_none() {
        tracing::debug!(key, value = raw, "ignoring unparseable config value");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.max_buffer_bytes, 40 * 1024 * 1024);
        assert_eq!(config.max_batch_records, 64);
        assert_eq!(config.drain_interval, Duration::from_secs(1));
        assert_eq!(config.send_timeout, Duration::from_secs(10));
        assert!(config.buffer_path.ends_with("buffer.json"));
    }

    #[test]
    fn map_values_override_defaults() {
        let config = BackendConfig::from_map(&map(&[
            ("buffer_path", "/tmp/spool/buffer.json"),
            ("max_buffer_bytes", "1024"),
            ("send_timeout_ms", "1500"),
            ("retry_initial_delay_ms", "100"),
            ("retry_backoff_multiplier", "3"),
            ("service_name", "worker"),
            ("log_level", "debug"),
        ]));

        assert_eq!(config.buffer_path, PathBuf::from("/tmp/spool/buffer.json"));
        assert_eq!(config.max_buffer_bytes, 1024);
        assert_eq!(config.send_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(100));
        assert!((config.retry.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.service_name, "worker");
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn bad_map_values_fall_back() {
        let config = BackendConfig::from_map(&map(&[
            ("max_buffer_bytes", "0"),
            ("max_batch_records", "-3"),
            ("drain_interval_ms", "soon"),
            ("retry_backoff_multiplier", "0.5"),
            ("service_name", "  "),
        ]));
        let defaults = BackendConfig::default();

        assert_eq!(config.max_buffer_bytes, defaults.max_buffer_bytes);
        assert_eq!(config.max_batch_records, defaults.max_batch_records);
        assert_eq!(config.drain_interval, defaults.drain_interval);
        assert_eq!(config.retry, defaults.retry);
        assert_eq!(config.service_name, defaults.service_name);
    }

    #[test]
    fn toml_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace-spool.toml");
        std::fs::write(
            &path,
            r#"
                max_batch_records = 8
                drain_interval_ms = 50

                [retry]
                max_delay = 2000
            "#,
        )
        .unwrap();

        let config = BackendConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.max_batch_records, 8);
        assert_eq!(config.drain_interval, Duration::from_millis(50));
        assert_eq!(config.retry.max_delay, Duration::from_secs(2));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(config.exporter_config().max_batch_records, 8);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        for contents in ["max_batch_records = 0", "unknown_key = 1", "not toml ["] {
            let err = BackendConfig::from_toml_str(contents).unwrap_err();
            assert!(matches!(err, SpoolError::Config(_)), "{contents}: {err}");
        }

        let err = BackendConfig::from_toml_file(Path::new("/nonexistent/trace-spool.toml")).unwrap_err();
        assert!(matches!(err, SpoolError::Config(_)));
    }
}
