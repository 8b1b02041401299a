//! muxgate.toml configuration.

use std::path::Path;
use std::time::Duration;

use muxgate_core::config::duration_str;
use muxgate_core::{ConfigError, ConnectionConfig};
use serde::{Deserialize, Serialize};

/// Top-level load-run configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub connection: ConnectionConfig,
    pub load: LoadSettings,
    pub responder: ResponderConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSettings {
    pub workers: usize,
    pub requests: usize,
    /// Request body prefix; each request appends its index.
    pub body: String,
    /// Attempts per request, counting the first one.
    pub max_attempts: u32,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            requests: 300,
            body: "hello".to_string(),
            max_attempts: 8,
        }
    }
}

/// Behaviour of the echo responder on each dialed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    #[serde(with = "duration_str")]
    pub response_delay: Duration,
    /// Never answer; exercises the drain deadline.
    pub stall: bool,
    /// Seed for the `random` GOAWAY policy.
    pub seed: u64,
    pub goaway: GoAwayPolicy,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            response_delay: Duration::ZERO,
            stall: false,
            seed: 7,
            goaway: GoAwayPolicy::default(),
        }
    }
}

/// When the responder announces shutdown on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum GoAwayPolicy {
    Never,
    /// One response per connection, like `Connection: close`.
    #[default]
    AfterEachResponse,
    AfterResponses {
        count: u32,
    },
    /// A per-connection count drawn from `1..=max_responses`.
    Random {
        max_responses: u32,
    },
}

impl LoadConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoadConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        let load = &self.load;
        if load.workers == 0 {
            return Err(ConfigError::new("load.workers", "must be > 0"));
        }
        if load.requests < load.workers {
            return Err(ConfigError::new(
                "load.requests",
                format!(
                    "{} requests cannot keep {} workers busy",
                    load.requests, load.workers
                ),
            ));
        }
        if load.max_attempts == 0 {
            return Err(ConfigError::new("load.max_attempts", "must be > 0"));
        }
        if self.responder.stall && self.responder.goaway == GoAwayPolicy::Never {
            return Err(ConfigError::new(
                "responder.stall",
                "a stalled responder needs a goaway policy to end the run",
            ));
        }
        match self.responder.goaway {
            GoAwayPolicy::AfterResponses { count: 0 } => {
                Err(ConfigError::new("responder.goaway.count", "must be > 0"))
            }
            GoAwayPolicy::Random { max_responses: 0 } => Err(ConfigError::new(
                "responder.goaway.max_responses",
                "must be > 0",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = LoadConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("drain_timeout = \"2s\""));
        assert!(rendered.contains("mode = \"after-each-response\""));
        let parsed: LoadConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxgate.toml");
        std::fs::write(
            &path,
            r#"
[load]
workers = 4
requests = 40

[responder]
response_delay = "5ms"
goaway = { mode = "random", max_responses = 3 }
"#,
        )
        .unwrap();

        let config = LoadConfig::from_file(&path).unwrap();
        assert_eq!(config.load.workers, 4);
        assert_eq!(config.load.max_attempts, 8);
        assert_eq!(config.responder.response_delay, Duration::from_millis(5));
        assert_eq!(
            config.responder.goaway,
            GoAwayPolicy::Random { max_responses: 3 }
        );
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn rejects_fewer_requests_than_workers() {
        let mut config = LoadConfig::default();
        config.load.requests = 5;
        assert_eq!(config.validate().unwrap_err().field, "load.requests");
    }

    #[test]
    fn rejects_zero_values() {
        let mut config = LoadConfig::default();
        config.load.workers = 0;
        assert_eq!(config.validate().unwrap_err().field, "load.workers");

        let mut config = LoadConfig::default();
        config.load.max_attempts = 0;
        assert_eq!(config.validate().unwrap_err().field, "load.max_attempts");

        let mut config = LoadConfig::default();
        config.connection.max_frame_size = 0;
        assert_eq!(config.validate().unwrap_err().field, "max_frame_size");

        let mut config = LoadConfig::default();
        config.responder.goaway = GoAwayPolicy::AfterResponses { count: 0 };
        assert!(config.validate().is_err());

        let mut config = LoadConfig::default();
        config.responder.stall = true;
        config.responder.goaway = GoAwayPolicy::Never;
        assert_eq!(config.validate().unwrap_err().field, "responder.stall");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxgate.toml");
        std::fs::write(&path, "[load]\nworkers = 0\n").unwrap();
        assert!(LoadConfig::from_file(&path).is_err());
    }
}
