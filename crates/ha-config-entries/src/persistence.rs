//! On-disk form of the config entry registry
//!
//! Stored under the `core.config_entries` key. Older files may lack the
//! preference fields (they then default from the legacy `system_options`
//! block), carry `null` options, or hold non-string unique ids.

use chrono::{DateTime, Utc};
use ha_registries::Storable;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, EntryData,
};
use crate::runtime::EntryRuntime;

pub const STORAGE_KEY: &str = "core.config_entries";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Pre-storage file in the config directory, migrated on first start
pub const LEGACY_PATH: &str = ".config_entries.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    #[serde(default)]
    pub entries: Vec<StoredConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemOptions {
    #[serde(default)]
    pub disable_new_entities: bool,
}

/// One persisted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfigEntry {
    pub entry_id: String,
    pub version: u32,
    #[serde(default = "default_minor_version")]
    pub minor_version: u32,
    pub domain: String,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: EntryData,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: EntryData,
    #[serde(default)]
    pub pref_disable_new_entities: Option<bool>,
    #[serde(default)]
    pub pref_disable_polling: Option<bool>,
    pub source: ConfigEntrySource,
    #[serde(default, deserialize_with = "unique_id_as_string")]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub disabled_by: Option<ConfigEntryDisabledBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_options: Option<SystemOptions>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_minor_version() -> u32 {
    1
}

fn null_as_default<'de, D>(deserializer: D) -> Result<EntryData, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<EntryData>::deserialize(deserializer)?.unwrap_or_default())
}

/// Unique ids written by older integrations may be numbers
fn unique_id_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(unique_id)) => Some(unique_id),
        Some(other) => {
            error!(unique_id = %other, "Config entry has a non-string unique id, converting it");
            Some(other.to_string())
        }
    })
}

impl From<&ConfigEntry> for StoredConfigEntry {
    fn from(entry: &ConfigEntry) -> Self {
        Self {
            entry_id: entry.entry_id.clone(),
            version: entry.version,
            minor_version: entry.minor_version,
            domain: entry.domain.clone(),
            title: entry.title.clone(),
            data: entry.data.clone(),
            options: entry.options.clone(),
            pref_disable_new_entities: Some(entry.pref_disable_new_entities),
            pref_disable_polling: Some(entry.pref_disable_polling),
            source: entry.source,
            unique_id: entry.unique_id.clone(),
            disabled_by: entry.disabled_by,
            system_options: None,
            created_at: entry.created_at,
            modified_at: entry.modified_at,
        }
    }
}

impl StoredConfigEntry {
    /// Build the runtime entry, in the NotLoaded state
    pub fn into_entry(self) -> ConfigEntry {
        let legacy_disable_new_entities = self
            .system_options
            .map(|options| options.disable_new_entities)
            .unwrap_or(false);

        ConfigEntry {
            entry_id: self.entry_id,
            domain: self.domain,
            title: self.title,
            data: self.data,
            options: self.options,
            version: self.version,
            minor_version: self.minor_version,
            unique_id: self.unique_id,
            source: self.source,
            disabled_by: self.disabled_by,
            pref_disable_new_entities: self
                .pref_disable_new_entities
                .unwrap_or(legacy_disable_new_entities),
            pref_disable_polling: self.pref_disable_polling.unwrap_or(false),
            created_at: self.created_at,
            modified_at: self.modified_at,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
            supports_unload: None,
            supports_remove_device: None,
            runtime: Arc::new(EntryRuntime::default()),
        }
    }
}
