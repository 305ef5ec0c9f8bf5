//! Saving and loading the config entry registry

mod common;

use std::sync::Arc;

use common::{data, settings};
use ha_config::ConfigEntriesSettings;
use ha_config_entries::{
    ConfigEntries, ConfigEntriesData, ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource,
    ConfigEntryState, ConfigEntryUpdate, STORAGE_KEY,
};
use ha_core::CoreState;
use ha_event_bus::EventBus;
use ha_registries::{Storage, StorageFile};
use serde_json::json;
use tempfile::TempDir;

fn hub_in(dir: &TempDir, settings: ConfigEntriesSettings) -> Arc<ConfigEntries> {
    ConfigEntries::new(Storage::new(dir.path()), Arc::new(EventBus::new()), settings)
}

/// A long save delay, so only explicit flushes write
fn slow_save() -> ConfigEntriesSettings {
    ConfigEntriesSettings {
        save_delay: 3600.0,
        ..settings()
    }
}

async fn stored(dir: &TempDir) -> Option<StorageFile<ConfigEntriesData>> {
    Storage::new(dir.path()).load(STORAGE_KEY).await.unwrap()
}

#[tokio::test]
async fn test_entries_survive_restart() {
    let dir = TempDir::new().unwrap();
    let hub = hub_in(&dir, slow_save());

    let first = hub
        .add(
            ConfigEntry::new("hue", "Living room")
                .with_unique_id("bridge-1")
                .with_data(data(&[("host", json!("10.0.0.2"))]))
                .with_options(data(&[("allow_groups", json!(true))]))
                .with_version(2, 3),
        )
        .await
        .unwrap();
    let second = hub
        .add(
            ConfigEntry::new("mqtt", "Broker")
                .with_source(ConfigEntrySource::Import)
                .with_disabled_by(Some(ConfigEntryDisabledBy::User))
                .with_prefs(true, true),
        )
        .await
        .unwrap();
    let third = hub
        .add(ConfigEntry::new("hue", "Ignored bridge").with_source(ConfigEntrySource::Ignore))
        .await
        .unwrap();
    hub.flush().await.unwrap();

    let file = stored(&dir).await.unwrap();
    assert_eq!(file.key, STORAGE_KEY);
    assert_eq!(file.data.entries.len(), 3);

    let restarted = hub_in(&dir, slow_save());
    restarted.initialize().await.unwrap();

    assert_eq!(
        restarted.entry_ids(),
        vec![
            first.entry_id().to_string(),
            second.entry_id().to_string(),
            third.entry_id().to_string()
        ]
    );

    let hue = restarted.get_entry(first.entry_id()).unwrap();
    assert_eq!(hue.unique_id(), Some("bridge-1"));
    assert_eq!(hue.data()["host"], json!("10.0.0.2"));
    assert_eq!(hue.options()["allow_groups"], json!(true));
    assert_eq!((hue.version(), hue.minor_version()), (2, 3));
    assert_eq!(hue.state(), ConfigEntryState::NotLoaded);
    assert_eq!(hue.created_at(), first.created_at());

    let mqtt = restarted.get_entry(second.entry_id()).unwrap();
    assert_eq!(mqtt.source(), ConfigEntrySource::Import);
    assert_eq!(mqtt.disabled_by(), Some(ConfigEntryDisabledBy::User));
    assert!(mqtt.pref_disable_new_entities());
    assert!(mqtt.pref_disable_polling());

    assert!(restarted.get_entry(third.entry_id()).unwrap().is_ignored());
    assert_eq!(restarted.domains(false, true), vec!["hue", "mqtt"]);
}

#[tokio::test]
async fn test_legacy_file_is_migrated() {
    let dir = TempDir::new().unwrap();
    let legacy = json!([
        {
            "entry_id": "legacy-1",
            "version": 1,
            "domain": "zwave",
            "title": "Z-Wave stick",
            "data": {"usb_path": "/dev/ttyACM0"},
            "options": null,
            "source": "user",
            "unique_id": 4021,
            "system_options": {"disable_new_entities": true}
        }
    ]);
    std::fs::write(
        dir.path().join(".config_entries.json"),
        serde_json::to_string(&legacy).unwrap(),
    )
    .unwrap();

    let hub = hub_in(&dir, slow_save());
    hub.initialize().await.unwrap();

    let entry = hub.get_entry("legacy-1").unwrap();
    assert_eq!(entry.domain(), "zwave");
    assert_eq!(entry.unique_id(), Some("4021"));
    assert!(entry.options().is_empty());
    assert_eq!(entry.minor_version(), 1);
    assert!(entry.pref_disable_new_entities());
    assert!(!entry.pref_disable_polling());

    // The legacy file is replaced by the storage file
    assert!(!dir.path().join(".config_entries.json").exists());
    let file = stored(&dir).await.unwrap();
    assert_eq!(file.data.entries[0].entry_id, "legacy-1");
}

#[tokio::test]
async fn test_saves_are_delayed_and_coalesced() {
    let dir = TempDir::new().unwrap();
    let hub = hub_in(&dir, slow_save());

    let entry = hub.add(ConfigEntry::new("hue", "Bridge")).await.unwrap();
    for title in ["One", "Two", "Three"] {
        hub.update_entry(entry.entry_id(), ConfigEntryUpdate::new().title(title))
            .unwrap();
    }
    assert!(stored(&dir).await.is_none());

    hub.flush().await.unwrap();
    let file = stored(&dir).await.unwrap();
    assert_eq!(file.data.entries.len(), 1);
    assert_eq!(file.data.entries[0].title, "Three");
}

#[tokio::test]
async fn test_delayed_save_writes_after_delay() {
    let dir = TempDir::new().unwrap();
    let hub = hub_in(
        &dir,
        ConfigEntriesSettings {
            save_delay: 0.05,
            ..settings()
        },
    );

    hub.add(ConfigEntry::new("hue", "Bridge")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let file = stored(&dir).await.unwrap();
    assert_eq!(file.data.entries[0].title, "Bridge");
}

#[tokio::test]
async fn test_stopping_flushes_pending_save() {
    let dir = TempDir::new().unwrap();
    let hub = hub_in(&dir, slow_save());
    hub.set_core_state(CoreState::Running).await;

    let entry = hub.add(ConfigEntry::new("hue", "Bridge")).await.unwrap();
    hub.remove(entry.entry_id()).await.unwrap();
    hub.add(ConfigEntry::new("mqtt", "Broker")).await.unwrap();
    assert!(stored(&dir).await.is_none());

    hub.set_core_state(CoreState::Stopping).await;

    let file = stored(&dir).await.unwrap();
    assert_eq!(file.data.entries.len(), 1);
    assert_eq!(file.data.entries[0].domain, "mqtt");
}
