//! YAML configuration loading for Home Assistant
//!
//! Reads `configuration.yaml` from the config directory. Only the sections
//! the config entry hub consumes are modelled; unknown keys are ignored so
//! a full Home Assistant configuration file can be pointed at directly.
//!
//! ```yaml
//! homeassistant:
//!   name: Home
//! config_entries:
//!   save_delay: 1
//!   unload_timeout: 10
//! ```

mod error;
mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{load_config, ConfigEntriesSettings, HubConfig, CONFIG_FILE};
