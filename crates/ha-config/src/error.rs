//! Errors raised while reading `configuration.yaml`

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML or a section has the wrong shape
    #[error("failed to parse {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A setting parsed but is out of range, e.g. `config_entries.unload_timeout: 0`
    #[error("invalid value for '{section}.{key}': {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn config_entries(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            section: "config_entries",
            key,
            reason: reason.into(),
        }
    }
}
