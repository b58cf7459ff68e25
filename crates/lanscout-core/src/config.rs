//! Configuration management for lanscout.
//!
//! Supports:
//! - Loading from YAML files
//! - Environment variable overrides (`LANSCOUT__DISCOVERY__POLL_INTERVAL_MS=20`)
//! - Validation of all settings

use crate::error::{ConfigError, DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Root configuration.
///
/// # Examples
///
/// ```no_run
/// use lanscout_core::config::AppConfig;
///
/// let config = AppConfig::from_file("lanscout.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Discovery engine settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering `LANSCOUT__*`
    /// environment variables over the file.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("LANSCOUT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        self.logging.parse_level()?;
        Ok(())
    }
}

/// What a browse "remove" event produces for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// Release any in-flight resolve for the instance; emit nothing
    #[default]
    Silent,
    /// Additionally re-emit the last resolved record with `"action":"remove"`
    Emit,
}

/// Address family requested during address lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
    Any,
}

impl AddressFamily {
    pub fn accepts(&self, ip: &std::net::IpAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => ip.is_ipv4(),
            AddressFamily::Ipv6 => ip.is_ipv6(),
            AddressFamily::Any => true,
        }
    }
}

/// Discovery engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Bounded wait of each session pump for provider activity
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Whether browse "remove" events are surfaced to subscribers
    #[serde(default)]
    pub removal_policy: RemovalPolicy,

    /// How long the pump waits for room in the fan-out queue
    #[serde(default = "default_fanout_grace")]
    pub fanout_grace_ms: u64,

    /// Capacity of the queue between a session pump and its dispatcher
    #[serde(default = "default_fanout_queue_capacity")]
    pub fanout_queue_capacity: usize,

    /// Domain used when the provider reports none
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Address family requested in the address lookup stage
    #[serde(default)]
    pub address_family: AddressFamily,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            removal_policy: RemovalPolicy::default(),
            fanout_grace_ms: default_fanout_grace(),
            fanout_queue_capacity: default_fanout_queue_capacity(),
            domain: default_domain(),
            address_family: AddressFamily::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fanout_grace(&self) -> Duration {
        Duration::from_millis(self.fanout_grace_ms)
    }

    /// Validates the configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 1000 {
            return Err(ConfigError::invalid_value(
                "discovery.poll_interval_ms",
                format!("must be within 1..=1000, got {}", self.poll_interval_ms),
            ));
        }

        if self.fanout_grace_ms == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.fanout_grace_ms",
                "cannot be 0",
            ));
        }

        if self.fanout_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.fanout_queue_capacity",
                "cannot be 0",
            ));
        }

        if self.domain.trim().is_empty() {
            return Err(ConfigError::invalid_value("discovery.domain", "cannot be empty"));
        }

        Ok(())
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_fanout_grace() -> u64 {
    250
}

fn default_fanout_queue_capacity() -> usize {
    64
}

fn default_domain() -> String {
    "local.".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            DiscoveryError::from(ConfigError::invalid_value(
                "logging.level",
                format!("Invalid log level: {}", self.level),
            ))
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.discovery.poll_interval_ms, 10);
        assert_eq!(config.discovery.removal_policy, RemovalPolicy::Silent);
        assert_eq!(config.discovery.domain, "local.");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
discovery:
  poll_interval_ms: 25
  removal_policy: emit
  address_family: any

logging:
  level: debug
  format: json
"#;

        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.discovery.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.discovery.removal_policy, RemovalPolicy::Emit);
        assert_eq!(config.discovery.address_family, AddressFamily::Any);
        assert_eq!(config.discovery.fanout_queue_capacity, 64);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.parse_level().unwrap(), Level::DEBUG);
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(AppConfig::from_yaml("discovery: [1, 2").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = DiscoveryConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            poll_interval_ms: 5000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            fanout_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            domain: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let config = AppConfig {
            logging: LoggingConfig {
                level: "chatty".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_family_filter() {
        let v4: std::net::IpAddr = "10.0.0.5".parse().unwrap();
        let v6: std::net::IpAddr = "fe80::1".parse().unwrap();
        assert!(AddressFamily::Ipv4.accepts(&v4));
        assert!(!AddressFamily::Ipv4.accepts(&v6));
        assert!(AddressFamily::Ipv6.accepts(&v6));
        assert!(AddressFamily::Any.accepts(&v4));
    }
}
