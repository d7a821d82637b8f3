//! Gateway configuration.
//!
//! A small TOML file wires the coordinator together: where the ledger
//! database and policy document live, which signing key to use, and the
//! notification/broker knobs. Everything has a sensible default so a dev
//! gateway runs from an empty file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML or does not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Path of the ledger database file.
    pub db_path: PathBuf,
    /// Path of the policy document.
    pub policy_path: PathBuf,
    /// Path of the signing-key seed file; generated on first use.
    pub key_path: PathBuf,
    /// Key id recorded in receipts.
    pub key_id: String,
    /// Notification settings.
    pub slack: SlackConfig,
    /// Broker settings.
    pub broker: BrokerConfig,
    /// Outbox worker settings.
    pub outbox: OutboxSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("relia.db"),
            policy_path: PathBuf::from("policy.yaml"),
            key_path: PathBuf::from("signing.key"),
            key_id: "relia-dev".to_string(),
            slack: SlackConfig::default(),
            broker: BrokerConfig::default(),
            outbox: OutboxSettings::default(),
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Channel approval requests are posted to; empty disables posting.
    pub channel: String,
}

/// Broker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Default region for minted credentials; empty uses provider default.
    pub region: String,
}

/// Outbox worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Seconds between delivery passes.
    pub poll_interval_secs: u64,
    /// Attempts before an entry is marked failed.
    pub max_attempts: u32,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_attempts: 8,
        }
    }
}

impl GatewayConfig {
    /// Reads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O, parse, or validation failure.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "outbox.max_attempts must be at least 1".to_string(),
            });
        }
        if self.key_id.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "key_id must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Converts the outbox settings into a worker config.
    #[must_use]
    pub fn outbox_config(&self) -> crate::outbox::OutboxConfig {
        crate::outbox::OutboxConfig {
            max_attempts: self.outbox.max_attempts,
            poll_interval: std::time::Duration::from_secs(self.outbox.poll_interval_secs),
            ..crate::outbox::OutboxConfig::default()
        }
    }
}
