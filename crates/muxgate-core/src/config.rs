//! Connection tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration value failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Grace period between the shutdown signal and force-closing streams.
    #[serde(with = "duration_str")]
    pub drain_timeout: Duration,
    /// Body writes are split into frames of at most this many bytes.
    pub max_frame_size: usize,
    /// Frames buffered per stream direction before writers wait.
    pub stream_window: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(2),
            max_frame_size: 16 * 1024,
            stream_window: 8,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::new("max_frame_size", "must be > 0"));
        }
        if self.stream_window == 0 {
            return Err(ConfigError::new("stream_window", "must be > 0"));
        }
        Ok(())
    }
}

/// Durations as `"250ms"` / `"2s"` strings.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, Duration::from_secs)
        } else {
            return Err(format!("duration {s:?} needs an `ms` or `s` suffix"));
        };
        digits
            .trim()
            .parse::<u64>()
            .map(unit)
            .map_err(|e| format!("duration {s:?}: {e}"))
    }

    pub fn format(d: Duration) -> String {
        if d.subsec_millis() == 0 {
            format!("{}s", d.as_secs())
        } else {
            format!("{}ms", d.as_millis())
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}
