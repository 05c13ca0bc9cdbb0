//! Configuration management for ringtun.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring::valid_capacity;
use crate::tun::EndpointOptions;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Router configuration.
    #[serde(default)]
    pub router: RouterConfig,

    /// The fallback endpoint for destinations no entry matches.
    #[serde(default)]
    pub default_endpoint: Option<EndpointOptions>,

    /// Per-virtual-IP endpoints.
    #[serde(default)]
    pub endpoints: Vec<EndpointOptions>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            let address = endpoint.address.ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "endpoint '{}' needs a virtual IP address",
                    endpoint.name
                ))
            })?;
            if !seen.insert(address) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate endpoint address {address}"
                )));
            }
        }
        for endpoint in self.endpoints.iter().chain(self.default_endpoint.iter()) {
            if !valid_capacity(endpoint.ring_capacity) {
                return Err(Error::InvalidConfig(format!(
                    "endpoint '{}': ring capacity {} must be a power of two between {} and {}",
                    endpoint.name,
                    endpoint.ring_capacity,
                    crate::ring::MIN_RING_CAPACITY,
                    crate::ring::MAX_RING_CAPACITY,
                )));
            }
        }
        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "ringtun", "ringtun").map_or_else(
            || PathBuf::from("ringtun.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            default_endpoint: Some(EndpointOptions {
                name: "ringtun0".into(),
                ..Default::default()
            }),
            endpoints: vec![
                EndpointOptions {
                    name: "ringtun1".into(),
                    address: Some("10.8.0.2".parse().unwrap()),
                    ..Default::default()
                },
                EndpointOptions {
                    name: "ringtun2".into(),
                    address: Some("10.8.0.3".parse().unwrap()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How often the demo binary logs router counters.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            stats_interval: default_stats_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_round_trips() {
        let config = Config::example();
        config.validate().unwrap();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.endpoints.len(), 2);
        assert_eq!(parsed.endpoints[0].name, "ringtun1");
    }

    #[test]
    fn rejects_endpoint_without_address() {
        let mut config = Config::example();
        config.endpoints[0].address = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let mut config = Config::example();
        config.endpoints[1].address = config.endpoints[0].address;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_ring_capacity() {
        let mut config = Config::example();
        config.endpoints[0].ring_capacity = 12345;
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.endpoints.is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.router.stats_interval, Duration::from_secs(30));
    }
}
