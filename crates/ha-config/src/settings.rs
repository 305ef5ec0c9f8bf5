//! Hub configuration
//!
//! Parses the `homeassistant:` and `config_entries:` sections from
//! configuration.yaml.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "configuration.yaml";

/// Tunables for the config entry lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigEntriesSettings {
    /// Seconds to coalesce registry writes before saving
    pub save_delay: f64,
    /// Seconds during which repeated discovery notifications are merged
    pub discovery_cooldown: f64,
    /// Seconds to wait for entry tasks to finish on unload
    pub unload_timeout: f64,
    /// Base delay in seconds for the first setup retry
    pub retry_base: f64,
    /// Largest exponent applied to the retry base (4 → x16)
    pub retry_max_exponent: u32,
}

impl Default for ConfigEntriesSettings {
    fn default() -> Self {
        Self {
            save_delay: 1.0,
            discovery_cooldown: 1.0,
            unload_timeout: 10.0,
            retry_base: 5.0,
            retry_max_exponent: 4,
        }
    }
}

impl ConfigEntriesSettings {
    pub fn save_delay(&self) -> Duration {
        Duration::from_secs_f64(self.save_delay)
    }

    pub fn discovery_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_cooldown)
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.unload_timeout)
    }

    /// Reject values that would break retry or unload timing
    pub fn validate(&self) -> ConfigResult<()> {
        check_seconds("save_delay", self.save_delay, false)?;
        check_seconds("discovery_cooldown", self.discovery_cooldown, false)?;
        check_seconds("unload_timeout", self.unload_timeout, true)?;
        check_seconds("retry_base", self.retry_base, true)?;
        if self.retry_max_exponent > 16 {
            return Err(ConfigError::config_entries(
                "retry_max_exponent",
                format!("{} is larger than 16", self.retry_max_exponent),
            ));
        }
        Ok(())
    }
}

fn check_seconds(key: &'static str, value: f64, positive: bool) -> ConfigResult<()> {
    if !value.is_finite() || value < 0.0 || (positive && value == 0.0) {
        return Err(ConfigError::config_entries(
            key,
            format!("{value} is not a valid number of seconds"),
        ));
    }
    Ok(())
}

/// Core `homeassistant:` section, reduced to what the hub uses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSection {
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_name() -> String {
    "Home".to_string()
}

impl Default for CoreSection {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

/// Parsed configuration.yaml
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HubConfig {
    /// Directory the configuration was read from (not part of the file)
    #[serde(skip)]
    pub config_dir: PathBuf,

    #[serde(default)]
    pub homeassistant: CoreSection,

    #[serde(default)]
    pub config_entries: ConfigEntriesSettings,
}

impl HubConfig {
    /// Path of a file relative to the config directory
    pub fn path(&self, name: &str) -> PathBuf {
        self.config_dir.join(name)
    }
}

/// Load configuration.yaml from `config_dir`.
///
/// A missing file yields the default configuration.
pub fn load_config(config_dir: impl AsRef<Path>) -> ConfigResult<HubConfig> {
    let config_dir = config_dir.as_ref();
    let path = config_dir.join(CONFIG_FILE);

    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            HubConfig::default()
        } else {
            serde_yaml::from_str::<HubConfig>(&content)
                .map_err(|source| ConfigError::ParseYaml { path: path.clone(), source })?
        }
    } else {
        debug!("No {} in {:?}, using defaults", CONFIG_FILE, config_dir);
        HubConfig::default()
    };

    config.config_entries.validate()?;
    config.config_dir = config_dir.to_path_buf();

    info!("Loaded configuration for '{}'", config.homeassistant.name);
    Ok(config)
}
