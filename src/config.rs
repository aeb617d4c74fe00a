//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`HSMLINK_*`)
//! - Direct construction

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{HsmError, Result};
use crate::pool::MAX_POOL_SIZE;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connector endpoint, `host:port`
    pub connector_url: String,

    /// Slot of the authentication key on the device
    pub auth_key_slot: u16,

    /// Password the authentication key is derived from
    pub password: String,

    /// Number of sessions to keep open, 1..=16
    #[serde(default = "default_pool_size")]
    pub pool_size: u8,
}

fn default_pool_size() -> u8 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connector_url: "127.0.0.1:12345".to_string(),
            auth_key_slot: 1,
            password: String::new(),
            pool_size: default_pool_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| HsmError::InvalidConfig(format!("failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| HsmError::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("HSMLINK_CONNECTOR_URL") {
            config.connector_url = url;
        }
        if let Ok(slot) = std::env::var("HSMLINK_AUTH_KEY_SLOT") {
            if let Ok(slot) = slot.parse() {
                config.auth_key_slot = slot;
            }
        }
        if let Ok(password) = std::env::var("HSMLINK_PASSWORD") {
            config.password = password;
        }
        if let Ok(size) = std::env::var("HSMLINK_POOL_SIZE") {
            if let Ok(size) = size.parse() {
                config.pool_size = size;
            }
        }

        config
    }

    /// Check invariants the pool depends on.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(HsmError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if usize::from(self.pool_size) > MAX_POOL_SIZE {
            return Err(HsmError::InvalidConfig(format!(
                "pool_size {} exceeds session limit {}",
                self.pool_size, MAX_POOL_SIZE
            )));
        }
        if self.connector_url.is_empty() {
            return Err(HsmError::InvalidConfig(
                "connector_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_pool_size_bounds() {
        let mut config = Config::default();

        config.pool_size = 0;
        assert!(config.validate().is_err());

        config.pool_size = 16;
        assert!(config.validate().is_ok());

        config.pool_size = 17;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml = r#"
            connector_url = "hsm.internal:12345"
            auth_key_slot = 3
            password = "correct horse"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.connector_url, "hsm.internal:12345");
        assert_eq!(config.auth_key_slot, 3);
        assert_eq!(config.pool_size, 1); // default applies
    }
}
