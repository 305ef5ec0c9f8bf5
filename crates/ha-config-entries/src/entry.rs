//! Config Entry types
//!
//! A ConfigEntry represents a single instance of an integration's configuration.
//! Values handed out by the manager are snapshots: fields are read through
//! getters, and every change goes through [`crate::ConfigEntries`] so the
//! registry indexes, listeners and storage stay in step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::runtime::EntryRuntime;

/// Key/value payload of an entry (`data` and `options`)
pub type EntryData = HashMap<String, serde_json::Value>;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    /// Currently being set up
    SetupInProgress,
    /// Successfully set up
    Loaded,
    /// Setup failed
    SetupError,
    /// Not ready yet, a retry is scheduled
    SetupRetry,
    /// Version migration failed
    MigrationError,
    /// Unload failed or is not supported
    FailedUnload,
}

impl ConfigEntryState {
    /// Whether unload and reload are permitted from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigEntryState::NotLoaded => "not_loaded",
            ConfigEntryState::SetupInProgress => "setup_in_progress",
            ConfigEntryState::Loaded => "loaded",
            ConfigEntryState::SetupError => "setup_error",
            ConfigEntryState::SetupRetry => "setup_retry",
            ConfigEntryState::MigrationError => "migration_error",
            ConfigEntryState::FailedUnload => "failed_unload",
        }
    }
}

impl fmt::Display for ConfigEntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the config entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Configured via UI/API
    #[default]
    User,
    /// Imported from YAML config
    Import,
    /// Generic discovery
    Discovery,
    Bluetooth,
    Dhcp,
    Hardware,
    Hassio,
    Homekit,
    IntegrationDiscovery,
    Mqtt,
    Ssdp,
    Usb,
    Zeroconf,
    /// System-created entry
    System,
    /// Placeholder hiding a discovery
    Ignore,
    /// Rediscovery after an ignored entry was removed
    Unignore,
    /// Re-authentication flow
    Reauth,
    /// User reconfiguring an existing entry
    Reconfigure,
}

impl ConfigEntrySource {
    pub const ALL: [ConfigEntrySource; 18] = [
        ConfigEntrySource::User,
        ConfigEntrySource::Import,
        ConfigEntrySource::Discovery,
        ConfigEntrySource::Bluetooth,
        ConfigEntrySource::Dhcp,
        ConfigEntrySource::Hardware,
        ConfigEntrySource::Hassio,
        ConfigEntrySource::Homekit,
        ConfigEntrySource::IntegrationDiscovery,
        ConfigEntrySource::Mqtt,
        ConfigEntrySource::Ssdp,
        ConfigEntrySource::Usb,
        ConfigEntrySource::Zeroconf,
        ConfigEntrySource::System,
        ConfigEntrySource::Ignore,
        ConfigEntrySource::Unignore,
        ConfigEntrySource::Reauth,
        ConfigEntrySource::Reconfigure,
    ];

    /// The wire name, which is also the first step of a flow with this source
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigEntrySource::User => "user",
            ConfigEntrySource::Import => "import",
            ConfigEntrySource::Discovery => "discovery",
            ConfigEntrySource::Bluetooth => "bluetooth",
            ConfigEntrySource::Dhcp => "dhcp",
            ConfigEntrySource::Hardware => "hardware",
            ConfigEntrySource::Hassio => "hassio",
            ConfigEntrySource::Homekit => "homekit",
            ConfigEntrySource::IntegrationDiscovery => "integration_discovery",
            ConfigEntrySource::Mqtt => "mqtt",
            ConfigEntrySource::Ssdp => "ssdp",
            ConfigEntrySource::Usb => "usb",
            ConfigEntrySource::Zeroconf => "zeroconf",
            ConfigEntrySource::System => "system",
            ConfigEntrySource::Ignore => "ignore",
            ConfigEntrySource::Unignore => "unignore",
            ConfigEntrySource::Reauth => "reauth",
            ConfigEntrySource::Reconfigure => "reconfigure",
        }
    }

    pub fn from_step(step_id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|source| source.as_str() == step_id)
    }

    /// Automatic detection sources. Their flows feed the discovery notification.
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            ConfigEntrySource::Bluetooth
                | ConfigEntrySource::Dhcp
                | ConfigEntrySource::Discovery
                | ConfigEntrySource::Hardware
                | ConfigEntrySource::Homekit
                | ConfigEntrySource::Import
                | ConfigEntrySource::IntegrationDiscovery
                | ConfigEntrySource::Mqtt
                | ConfigEntrySource::Ssdp
                | ConfigEntrySource::Unignore
                | ConfigEntrySource::Usb
                | ConfigEntrySource::Zeroconf
        )
    }
}

impl fmt::Display for ConfigEntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason an entry was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    /// Disabled by the user
    User,
}

/// Kind of change broadcast to config entry subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryChange {
    Added,
    Updated,
    Removed,
}

/// A configuration entry for an integration
#[derive(Clone)]
pub struct ConfigEntry {
    pub(crate) entry_id: String,
    pub(crate) domain: String,
    pub(crate) title: String,
    pub(crate) data: EntryData,
    pub(crate) options: EntryData,
    pub(crate) version: u32,
    pub(crate) minor_version: u32,
    pub(crate) unique_id: Option<String>,
    pub(crate) source: ConfigEntrySource,
    pub(crate) disabled_by: Option<ConfigEntryDisabledBy>,
    pub(crate) pref_disable_new_entities: bool,
    pub(crate) pref_disable_polling: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) modified_at: DateTime<Utc>,

    // Runtime only, never persisted
    pub(crate) state: ConfigEntryState,
    pub(crate) reason: Option<String>,
    pub(crate) tries: u32,
    pub(crate) supports_unload: Option<bool>,
    pub(crate) supports_remove_device: Option<bool>,
    /// Locks, tasks and callbacks shared by every snapshot of this entry
    pub(crate) runtime: Arc<EntryRuntime>,
}

impl fmt::Debug for ConfigEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigEntry")
            .field("entry_id", &self.entry_id)
            .field("version", &self.version)
            .field("domain", &self.domain)
            .field("title", &self.title)
            .field("state", &self.state)
            .field("unique_id", &self.unique_id)
            .finish()
    }
}

impl ConfigEntry {
    /// Create a new config entry
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: EntryData::new(),
            options: EntryData::new(),
            version: 1,
            minor_version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            disabled_by: None,
            pref_disable_new_entities: false,
            pref_disable_polling: false,
            created_at: now,
            modified_at: now,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
            supports_unload: None,
            supports_remove_device: None,
            runtime: Arc::new(EntryRuntime::default()),
        }
    }

    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = entry_id.into();
        self
    }

    pub fn with_data(mut self, data: EntryData) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: EntryData) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = version;
        self.minor_version = minor_version;
        self
    }

    pub fn with_disabled_by(mut self, disabled_by: Option<ConfigEntryDisabledBy>) -> Self {
        self.disabled_by = disabled_by;
        self
    }

    pub fn with_prefs(mut self, disable_new_entities: bool, disable_polling: bool) -> Self {
        self.pref_disable_new_entities = disable_new_entities;
        self.pref_disable_polling = disable_polling;
        self
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn data(&self) -> &EntryData {
        &self.data
    }

    pub fn options(&self) -> &EntryData {
        &self.options
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn minor_version(&self) -> u32 {
        self.minor_version
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn source(&self) -> ConfigEntrySource {
        self.source
    }

    pub fn state(&self) -> ConfigEntryState {
        self.state
    }

    /// Explanation attached when the entry entered an error state
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn disabled_by(&self) -> Option<ConfigEntryDisabledBy> {
        self.disabled_by
    }

    pub fn pref_disable_new_entities(&self) -> bool {
        self.pref_disable_new_entities
    }

    pub fn pref_disable_polling(&self) -> bool {
        self.pref_disable_polling
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Consecutive not-ready setup attempts
    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_ignored(&self) -> bool {
        self.source == ConfigEntrySource::Ignore
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Known once the entry has been set up at least once
    pub fn supports_unload(&self) -> bool {
        self.supports_unload.unwrap_or(false)
    }

    pub fn supports_remove_device(&self) -> bool {
        self.supports_remove_device.unwrap_or(false)
    }

    /// Summary used by entry listings
    pub fn to_json(&self, supports_options: bool, supports_reconfigure: bool) -> serde_json::Value {
        serde_json::json!({
            "entry_id": self.entry_id,
            "domain": self.domain,
            "title": self.title,
            "source": self.source,
            "state": self.state,
            "supports_options": supports_options,
            "supports_remove_device": self.supports_remove_device(),
            "supports_unload": self.supports_unload(),
            "supports_reconfigure": supports_reconfigure,
            "pref_disable_new_entities": self.pref_disable_new_entities,
            "pref_disable_polling": self.pref_disable_polling,
            "disabled_by": self.disabled_by,
            "reason": self.reason,
        })
    }
}

/// Changes applied through [`crate::ConfigEntries::update_entry`].
///
/// Unset fields are left alone.
#[derive(Debug, Default, Clone)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<EntryData>,
    pub options: Option<EntryData>,
    pub unique_id: Option<Option<String>>,
    pub version: Option<u32>,
    pub minor_version: Option<u32>,
    pub pref_disable_new_entities: Option<bool>,
    pub pref_disable_polling: Option<bool>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: EntryData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: EntryData) -> Self {
        self.options = Some(options);
        self
    }

    pub fn unique_id(mut self, unique_id: Option<String>) -> Self {
        self.unique_id = Some(unique_id);
        self
    }

    pub fn version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = Some(version);
        self.minor_version = Some(minor_version);
        self
    }

    pub fn minor_version(mut self, minor_version: u32) -> Self {
        self.minor_version = Some(minor_version);
        self
    }

    pub fn pref_disable_new_entities(mut self, value: bool) -> Self {
        self.pref_disable_new_entities = Some(value);
        self
    }

    pub fn pref_disable_polling(mut self, value: bool) -> Self {
        self.pref_disable_polling = Some(value);
        self
    }

    /// Apply to `entry`, returning whether anything differed.
    ///
    /// `unique_id` is not applied here: the registry owns that field.
    pub(crate) fn apply(&self, entry: &mut ConfigEntry) -> bool {
        let mut changed = false;

        macro_rules! set_if_changed {
            ($field:ident) => {
                if let Some(value) = &self.$field {
                    if entry.$field != *value {
                        entry.$field = value.clone();
                        changed = true;
                    }
                }
            };
        }

        set_if_changed!(minor_version);
        set_if_changed!(pref_disable_new_entities);
        set_if_changed!(pref_disable_polling);
        set_if_changed!(title);
        set_if_changed!(version);
        set_if_changed!(data);
        set_if_changed!(options);

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_entry_new() {
        let entry = ConfigEntry::new("hue", "Philips Hue");
        assert_eq!(entry.domain(), "hue");
        assert_eq!(entry.title(), "Philips Hue");
        assert_eq!(entry.state(), ConfigEntryState::NotLoaded);
        assert_eq!(entry.version(), 1);
        assert_eq!(entry.minor_version(), 1);
        assert!(!entry.entry_id().is_empty());
        assert!(!entry.supports_unload());
    }

    #[test]
    fn test_config_entry_builder() {
        let mut data = EntryData::new();
        data.insert("host".to_string(), serde_json::json!("192.168.1.1"));

        let entry = ConfigEntry::new("hue", "Philips Hue")
            .with_data(data)
            .with_unique_id("bridge-001")
            .with_source(ConfigEntrySource::Zeroconf)
            .with_disabled_by(Some(ConfigEntryDisabledBy::User));

        assert_eq!(entry.unique_id(), Some("bridge-001"));
        assert_eq!(entry.source(), ConfigEntrySource::Zeroconf);
        assert!(entry.data().contains_key("host"));
        assert!(entry.is_disabled());
    }

    #[test]
    fn test_state_recoverable() {
        assert!(ConfigEntryState::NotLoaded.is_recoverable());
        assert!(ConfigEntryState::Loaded.is_recoverable());
        assert!(ConfigEntryState::SetupError.is_recoverable());
        assert!(ConfigEntryState::SetupRetry.is_recoverable());

        assert!(!ConfigEntryState::SetupInProgress.is_recoverable());
        assert!(!ConfigEntryState::MigrationError.is_recoverable());
        assert!(!ConfigEntryState::FailedUnload.is_recoverable());
    }

    #[test]
    fn test_source_names_match_serde() {
        for source in ConfigEntrySource::ALL {
            let json = serde_json::to_value(source).unwrap();
            assert_eq!(json, source.as_str());
            assert_eq!(ConfigEntrySource::from_step(source.as_str()), Some(source));
        }
        assert_eq!(ConfigEntrySource::from_step("confirm"), None);
    }

    #[test]
    fn test_discovery_family() {
        assert!(ConfigEntrySource::Zeroconf.is_discovery());
        assert!(ConfigEntrySource::Import.is_discovery());
        assert!(ConfigEntrySource::Unignore.is_discovery());
        assert!(!ConfigEntrySource::User.is_discovery());
        assert!(!ConfigEntrySource::Hassio.is_discovery());
        assert!(!ConfigEntrySource::Reauth.is_discovery());
    }

    #[test]
    fn test_update_reports_only_real_changes() {
        let mut entry = ConfigEntry::new("hue", "Bridge");

        assert!(!ConfigEntryUpdate::new().title("Bridge").apply(&mut entry));
        assert!(ConfigEntryUpdate::new()
            .title("Upstairs")
            .pref_disable_polling(true)
            .apply(&mut entry));
        assert_eq!(entry.title(), "Upstairs");
        assert!(entry.pref_disable_polling());
    }

    #[test]
    fn test_json_summary() {
        let entry = ConfigEntry::new("hue", "Bridge");
        let json = entry.to_json(true, false);

        assert_eq!(json["state"], "not_loaded");
        assert_eq!(json["source"], "user");
        assert_eq!(json["supports_options"], true);
        assert_eq!(json["supports_unload"], false);
        assert!(json["reason"].is_null());
    }
}
