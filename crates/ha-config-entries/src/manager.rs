//! Config Entries Manager
//!
//! Owns the registry of config entries, persists it, and broadcasts every
//! add, update and removal. The setup/unload lifecycle lives in
//! [`crate::lifecycle`]; configuration flows in [`crate::config_flow`].

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::Utc;
use dashmap::DashMap;
use ha_config::ConfigEntriesSettings;
use ha_core::events::{CoreStateData, HOMEASSISTANT_STARTED, HOMEASSISTANT_STOP};
use ha_core::{Context, CoreState, Event};
use ha_event_bus::SharedEventBus;
use ha_registries::{IssueRegistry, PersistentNotifications, Storable, Storage, StorageResult, Store};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config_flow::{
    reauth_issue_id, ConfigEntriesFlowManager, FlowHandlerRegistration, ISSUE_DOMAIN,
};
use crate::entry::{
    ConfigEntry, ConfigEntryChange, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryUpdate,
};
use crate::error::{ConfigEntriesError, ConfigEntriesResult};
use crate::flow::{FlowContext, FlowContextMatch};
use crate::integration::Integration;
use crate::options_flow::OptionsFlowManager;
use crate::persistence::{ConfigEntriesData, StoredConfigEntry, LEGACY_PATH};
use crate::registry::ConfigEntryItems;

/// Outcome of [`ConfigEntries::remove`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoveResult {
    /// The entry could not be unloaded cleanly; a restart is needed to
    /// release what it held
    pub require_restart: bool,
}

/// Config Entries Manager
///
/// Manages the lifecycle of configuration entries including:
/// - Loading/saving from storage
/// - Entry creation, update and removal
/// - Setup, unload and reload of entries
/// - The config and options flow managers
pub struct ConfigEntries {
    settings: ConfigEntriesSettings,
    items: RwLock<ConfigEntryItems>,
    integrations: DashMap<String, Arc<dyn Integration>>,
    flow: ConfigEntriesFlowManager,
    options: OptionsFlowManager,
    store: Store<ConfigEntriesData>,
    bus: SharedEventBus,
    issues: Arc<IssueRegistry>,
    notifications: Arc<PersistentNotifications>,
    core_state: watch::Sender<CoreState>,
    /// Cancelled when the instance stops; pending retries listen to it
    pub(crate) shutdown: CancellationToken,
    /// Entry tasks and manager-spawned work, awaited by `block_till_done`
    pub(crate) tasks: TaskTracker,
    changes: broadcast::Sender<(ConfigEntryChange, ConfigEntry)>,
    weak: Weak<ConfigEntries>,
}

impl std::fmt::Debug for ConfigEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntries")
            .field("entries", &self.len())
            .field("core_state", &self.core_state())
            .finish()
    }
}

impl ConfigEntries {
    /// Create a new config entries manager
    pub fn new(storage: Storage, bus: SharedEventBus, settings: ConfigEntriesSettings) -> Arc<Self> {
        Self::with_registries(
            storage,
            bus,
            settings,
            Arc::new(IssueRegistry::new()),
            Arc::new(PersistentNotifications::new()),
        )
    }

    /// Create a manager that reports into existing issue and notification
    /// registries
    pub fn with_registries(
        storage: Storage,
        bus: SharedEventBus,
        settings: ConfigEntriesSettings,
        issues: Arc<IssueRegistry>,
        notifications: Arc<PersistentNotifications>,
    ) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        let (core_state, _) = watch::channel(CoreState::NotRunning);
        let store = Store::new(
            storage,
            ConfigEntriesData::KEY,
            ConfigEntriesData::VERSION,
            ConfigEntriesData::MINOR_VERSION,
        );

        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            flow: ConfigEntriesFlowManager::new(weak.clone(), settings.discovery_cooldown()),
            options: OptionsFlowManager::new(weak.clone()),
            settings,
            items: RwLock::new(ConfigEntryItems::new()),
            integrations: DashMap::new(),
            store,
            bus,
            issues,
            notifications,
            core_state,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            changes,
            weak: weak.clone(),
        })
    }

    pub(crate) fn arc(&self) -> ConfigEntriesResult<Arc<Self>> {
        self.weak.upgrade().ok_or(ConfigEntriesError::ManagerGone)
    }

    pub(crate) fn read_items(&self) -> RwLockReadGuard<'_, ConfigEntryItems> {
        self.items.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write_items(&self) -> RwLockWriteGuard<'_, ConfigEntryItems> {
        self.items.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the integration that handles entries of its domain
    pub fn register_integration(&self, integration: Arc<dyn Integration>) {
        let domain = integration.domain().to_string();
        debug!(domain = %domain, "Registered integration");
        self.integrations.insert(domain, integration);
    }

    pub fn register_flow_handler(&self, registration: FlowHandlerRegistration) {
        self.flow.register_handler(registration);
    }

    pub fn integration(&self, domain: &str) -> Option<Arc<dyn Integration>> {
        self.integrations.get(domain).map(|r| r.value().clone())
    }

    pub fn flow(&self) -> &ConfigEntriesFlowManager {
        &self.flow
    }

    pub fn options(&self) -> &OptionsFlowManager {
        &self.options
    }

    pub fn settings(&self) -> &ConfigEntriesSettings {
        &self.settings
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn issues(&self) -> &Arc<IssueRegistry> {
        &self.issues
    }

    pub fn notifications(&self) -> &Arc<PersistentNotifications> {
        &self.notifications
    }

    /// Receive every add, update and removal of an entry
    pub fn subscribe(&self) -> broadcast::Receiver<(ConfigEntryChange, ConfigEntry)> {
        self.changes.subscribe()
    }

    pub(crate) fn dispatch(&self, change: ConfigEntryChange, entry: ConfigEntry) {
        // No receivers is fine
        let _ = self.changes.send((change, entry));
    }

    pub fn core_state(&self) -> CoreState {
        *self.core_state.borrow()
    }

    pub(crate) fn watch_core_state(&self) -> watch::Receiver<CoreState> {
        self.core_state.subscribe()
    }

    /// Move the instance to `state`.
    ///
    /// Entering `Running` fires `homeassistant_started` and releases setup
    /// retries that were waiting for startup. Entering `Stopping` fires
    /// `homeassistant_stop` and shuts the manager down.
    pub async fn set_core_state(&self, state: CoreState) {
        let previous = self.core_state.send_replace(state);
        if previous == state {
            return;
        }
        info!(from = %previous, to = %state, "Core state changed");

        match state {
            CoreState::Running => self.fire_core_event(HOMEASSISTANT_STARTED, state),
            CoreState::Stopping => {
                self.fire_core_event(HOMEASSISTANT_STOP, state);
                self.shutdown().await;
            }
            _ => {}
        }
    }

    fn fire_core_event(&self, event_type: &str, state: CoreState) {
        let data = serde_json::to_value(CoreStateData { state }).unwrap_or_default();
        self.bus.fire(Event::new(event_type, data, Context::new()));
    }

    /// Load entries from storage.
    ///
    /// A legacy `.config_entries.json` in the config directory takes priority
    /// and is converted to the storage format, then deleted.
    pub async fn initialize(&self) -> ConfigEntriesResult<()> {
        let legacy = self
            .store
            .migrate_legacy(LEGACY_PATH, |raw| {
                Ok(serde_json::from_value(serde_json::json!({ "entries": raw }))?)
            })
            .await?;

        let data = match legacy {
            Some(data) => {
                info!("Migrated {} config entries from {}", data.entries.len(), LEGACY_PATH);
                data
            }
            None => match self.store.load().await? {
                Some(file) => {
                    info!(
                        "Loading {} config entries from storage (v{}.{})",
                        file.data.entries.len(),
                        file.version,
                        file.minor_version
                    );
                    file.data
                }
                None => ConfigEntriesData::default(),
            },
        };

        let mut items = ConfigEntryItems::new();
        for stored in data.entries {
            items.insert(stored.into_entry());
        }
        *self.write_items() = items;
        Ok(())
    }

    /// Domains that have entries, in registry order
    pub fn domains(&self, include_ignore: bool, include_disabled: bool) -> Vec<String> {
        let items = self.read_items();
        let mut domains: Vec<String> = Vec::new();
        for entry in items.values() {
            if (!include_ignore && entry.is_ignored()) || (!include_disabled && entry.is_disabled()) {
                continue;
            }
            if !domains.iter().any(|domain| domain == &entry.domain) {
                domains.push(entry.domain.clone());
            }
        }
        domains
    }

    pub fn get_entry(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.read_items().get(entry_id).cloned()
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.read_items().ids().cloned().collect()
    }

    /// Entries, optionally for one domain
    pub fn entries(
        &self,
        domain: Option<&str>,
        include_ignore: bool,
        include_disabled: bool,
    ) -> Vec<ConfigEntry> {
        let items = self.read_items();
        let keep = |entry: &&ConfigEntry| {
            (include_ignore || !entry.is_ignored()) && (include_disabled || !entry.is_disabled())
        };
        match domain {
            Some(domain) => items
                .entries_for_domain(domain)
                .into_iter()
                .filter(keep)
                .cloned()
                .collect(),
            None => items.values().filter(keep).cloned().collect(),
        }
    }

    pub fn has_entries(&self, domain: &str, include_ignore: bool, include_disabled: bool) -> bool {
        !self.entries(Some(domain), include_ignore, include_disabled).is_empty()
    }

    /// Loaded entries of a domain
    pub fn loaded_entries(&self, domain: &str) -> Vec<ConfigEntry> {
        self.read_items()
            .entries_for_domain(domain)
            .into_iter()
            .filter(|entry| entry.is_loaded())
            .cloned()
            .collect()
    }

    pub fn entry_for_domain_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.read_items()
            .entry_for_domain_unique_id(domain, unique_id)
            .cloned()
    }

    /// Summary of an entry for listings
    pub fn entry_json(&self, entry_id: &str) -> Option<serde_json::Value> {
        let entry = self.get_entry(entry_id)?;
        let registration = self.flow.registration(entry.domain());
        let supports_options = registration.as_ref().is_some_and(|r| r.supports_options());
        let supports_reconfigure = registration.as_ref().is_some_and(|r| r.has_reconfigure());
        Some(entry.to_json(supports_options, supports_reconfigure))
    }

    pub fn len(&self) -> usize {
        self.read_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_items().is_empty()
    }

    /// Add an entry and set it up
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        let entry_id = entry.entry_id.clone();
        {
            let mut items = self.write_items();
            if items.contains(&entry_id) {
                return Err(ConfigEntriesError::AlreadyExists(entry_id));
            }
            items.insert(entry.clone());
        }
        info!(domain = %entry.domain, entry_id = %entry_id, title = %entry.title, "Added config entry");
        self.dispatch(ConfigEntryChange::Added, entry);

        self.setup(&entry_id).await?;
        self.schedule_save();

        self.get_entry(&entry_id)
            .ok_or(ConfigEntriesError::UnknownEntry(entry_id))
    }

    /// Unload, clean up and delete an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<RemoveResult> {
        let entry = self
            .get_entry(entry_id)
            .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))?;

        let (unload_success, removed) = {
            let _guard = entry.runtime.setup_lock.lock().await;
            let current = self
                .get_entry(entry_id)
                .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))?;

            let unload_success = if current.state().is_recoverable() {
                self.unload_entry(entry_id).await?
            } else {
                current.state() != crate::entry::ConfigEntryState::FailedUnload
            };

            if !current.is_ignored() {
                self.call_remove_hook(&current).await;
            }

            let removed = self.write_items().remove(entry_id);
            self.schedule_save();
            (unload_success, removed)
        };

        for progress in self.flow.progress_by_handler(
            entry.domain(),
            Some(&FlowContextMatch {
                source: Some(ConfigEntrySource::Reauth),
                entry_id: Some(entry_id.to_string()),
                unique_id: None,
            }),
            true,
        ) {
            let _ = self.flow.abort(&progress.flow_id);
            self.issues
                .delete(ISSUE_DOMAIN, &reauth_issue_id(entry.domain(), entry_id));
        }

        // A removed ignore entry may be rediscovered
        if entry.is_ignored() {
            self.spawn_unignore_flow(entry.domain().to_string(), entry.unique_id.clone())?;
        }

        info!(domain = %entry.domain, entry_id, "Removed config entry");
        self.dispatch(ConfigEntryChange::Removed, removed.unwrap_or(entry));

        Ok(RemoveResult {
            require_restart: !unload_success,
        })
    }

    fn spawn_unignore_flow(&self, domain: String, unique_id: Option<String>) -> ConfigEntriesResult<()> {
        let hub = self.arc()?;
        self.tasks.spawn(async move {
            let context = FlowContext::new(ConfigEntrySource::Unignore);
            let data = serde_json::json!({ "unique_id": unique_id });
            if let Err(err) = hub.flow().init(&domain, context, Some(data)).await {
                debug!(domain = %domain, "Unignore flow not started: {}", err);
            }
        });
        Ok(())
    }

    async fn call_remove_hook(&self, entry: &ConfigEntry) {
        let Some(integration) = self.integration(entry.domain()) else {
            return;
        };
        if !integration.supports_remove_entry() {
            return;
        }
        use futures::FutureExt;
        match std::panic::AssertUnwindSafe(integration.remove_entry(entry))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(domain = %entry.domain, entry_id = %entry.entry_id, "Error calling entry remove callback: {}", err);
            }
            Err(_) => {
                tracing::error!(domain = %entry.domain, entry_id = %entry.entry_id, "Entry remove callback panicked");
            }
        }
    }

    /// Apply `update` to an entry.
    ///
    /// Returns whether anything changed. On change the entry's update
    /// listeners run, a save is scheduled and an update is broadcast.
    pub fn update_entry(&self, entry_id: &str, update: ConfigEntryUpdate) -> ConfigEntriesResult<bool> {
        let (entry, listeners) = {
            let mut items = self.write_items();
            let current = items
                .get(entry_id)
                .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))?;
            let domain = current.domain.clone();
            let current_unique_id = current.unique_id.clone();

            let mut changed = false;
            if let Some(unique_id) = &update.unique_id {
                if *unique_id != current_unique_id {
                    if let Some(other) = unique_id
                        .as_deref()
                        .and_then(|uid| items.entry_for_domain_unique_id(&domain, uid))
                    {
                        warn!(
                            domain = %domain,
                            entry_id,
                            other_entry_id = %other.entry_id,
                            "Unique id is already used by another entry of this domain"
                        );
                    }
                    items.update_unique_id(entry_id, unique_id.clone());
                    changed = true;
                }
            }

            let Some(entry) = items.get_mut(entry_id) else {
                return Err(ConfigEntriesError::UnknownEntry(entry_id.to_string()));
            };
            changed |= update.apply(entry);
            if !changed {
                return Ok(false);
            }
            entry.modified_at = Utc::now();
            (entry.clone(), entry.runtime.update_listeners())
        };

        if !listeners.is_empty() {
            let hub = self.arc()?;
            for listener in listeners {
                self.tasks.spawn(listener(hub.clone(), entry.clone()));
            }
        }

        self.schedule_save();
        self.dispatch(ConfigEntryChange::Updated, entry);
        Ok(true)
    }

    /// Enable or disable an entry, then reload it.
    ///
    /// Returns `true` right away when nothing changes.
    pub async fn set_disabled_by(
        &self,
        entry_id: &str,
        disabled_by: Option<ConfigEntryDisabledBy>,
    ) -> ConfigEntriesResult<bool> {
        let entry = {
            let mut items = self.write_items();
            let entry = items
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))?;
            if entry.disabled_by == disabled_by {
                return Ok(true);
            }
            entry.disabled_by = disabled_by;
            entry.clone()
        };
        info!(domain = %entry.domain, entry_id, ?disabled_by, "Changed config entry disabled state");
        self.schedule_save();
        self.dispatch(ConfigEntryChange::Updated, entry);

        self.reload(entry_id).await
    }

    /// Ask the entry's integration to re-authenticate
    pub fn start_reauth(
        &self,
        entry_id: &str,
        context: Option<FlowContext>,
        data: Option<crate::entry::EntryData>,
    ) -> ConfigEntriesResult<()> {
        let hub = self.arc()?;
        let entry = self
            .get_entry(entry_id)
            .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))?;
        self.flow.start_reauth(&hub, &entry, context, data);
        Ok(())
    }

    pub fn start_reconfigure(
        &self,
        entry_id: &str,
        context: Option<FlowContext>,
        data: Option<crate::entry::EntryData>,
    ) -> ConfigEntriesResult<()> {
        let hub = self.arc()?;
        let entry = self
            .get_entry(entry_id)
            .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))?;
        self.flow.start_reconfigure(&hub, &entry, context, data);
        Ok(())
    }

    /// Snapshot of what gets persisted
    pub fn data_to_save(&self) -> ConfigEntriesData {
        ConfigEntriesData {
            entries: self.read_items().values().map(StoredConfigEntry::from).collect(),
        }
    }

    /// Schedule a coalesced save after the configured delay
    pub(crate) fn schedule_save(&self) {
        let weak = self.weak.clone();
        self.store.delay_save(
            move || weak.upgrade().map(|hub| hub.data_to_save()),
            self.settings.save_delay(),
        );
    }

    /// Write any pending save now
    pub async fn flush(&self) -> StorageResult<()> {
        self.store.flush().await
    }

    /// Stop flows and retries and write pending changes
    pub async fn shutdown(&self) {
        info!("Shutting down config entries");
        self.flow.shutdown();
        self.shutdown.cancel();
        for entry in self.entries(None, true, true) {
            entry.runtime.cancel_retry();
        }
        if let Err(err) = self.store.flush().await {
            warn!("Failed to save config entries on shutdown: {}", err);
        }
    }

    /// Wait for every tracked task (entry tasks, update listeners, scheduled
    /// reloads and retried setups) to finish
    pub async fn block_till_done(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryData;
    use ha_event_bus::EventBus;
    use tempfile::TempDir;

    fn create_test_manager() -> (TempDir, Arc<ConfigEntries>) {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigEntries::new(
            Storage::new(temp_dir.path()),
            Arc::new(EventBus::new()),
            ConfigEntriesSettings::default(),
        );
        (temp_dir, manager)
    }

    fn insert(manager: &ConfigEntries, entry: ConfigEntry) -> String {
        let entry_id = entry.entry_id().to_string();
        manager.write_items().insert(entry);
        entry_id
    }

    #[tokio::test]
    async fn test_add_entry_without_integration() {
        let (_dir, manager) = create_test_manager();

        let entry = ConfigEntry::new("hue", "Philips Hue")
            .with_unique_id("bridge-001")
            .with_source(ConfigEntrySource::Discovery);

        let added = manager.add(entry).await.unwrap();
        assert_eq!(added.domain(), "hue");
        assert_eq!(added.state(), crate::entry::ConfigEntryState::NotLoaded);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_entry_id_rejected() {
        let (_dir, manager) = create_test_manager();

        let entry = ConfigEntry::new("hue", "Bridge 1");
        let duplicate = ConfigEntry::new("hue", "Bridge 2").with_entry_id(entry.entry_id());

        manager.add(entry).await.unwrap();
        let result = manager.add(duplicate).await;

        assert!(matches!(result, Err(ConfigEntriesError::AlreadyExists(_))));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_filters() {
        let (_dir, manager) = create_test_manager();

        insert(&manager, ConfigEntry::new("hue", "Hue 1"));
        insert(
            &manager,
            ConfigEntry::new("hue", "Ignored").with_source(ConfigEntrySource::Ignore),
        );
        insert(
            &manager,
            ConfigEntry::new("mqtt", "MQTT").with_disabled_by(Some(ConfigEntryDisabledBy::User)),
        );

        assert_eq!(manager.entries(Some("hue"), true, true).len(), 2);
        assert_eq!(manager.entries(Some("hue"), false, true).len(), 1);
        assert_eq!(manager.entries(None, true, false).len(), 2);
        assert_eq!(manager.domains(false, false), vec!["hue".to_string()]);
        assert_eq!(
            manager.domains(true, true),
            vec!["hue".to_string(), "mqtt".to_string()]
        );
        assert!(manager.has_entries("mqtt", false, true));
        assert!(!manager.has_entries("mqtt", false, false));
    }

    #[tokio::test]
    async fn test_update_entry() {
        let (_dir, manager) = create_test_manager();
        let entry_id = insert(&manager, ConfigEntry::new("hue", "Old Name").with_unique_id("a"));
        let mut changes = manager.subscribe();

        let changed = manager
            .update_entry(
                &entry_id,
                ConfigEntryUpdate::new()
                    .title("New Name")
                    .unique_id(Some("b".to_string())),
            )
            .unwrap();
        assert!(changed);

        let entry = manager.get_entry(&entry_id).unwrap();
        assert_eq!(entry.title(), "New Name");
        assert!(manager.entry_for_domain_unique_id("hue", "a").is_none());
        assert!(manager.entry_for_domain_unique_id("hue", "b").is_some());

        let (change, updated) = changes.recv().await.unwrap();
        assert_eq!(change, ConfigEntryChange::Updated);
        assert_eq!(updated.title(), "New Name");

        // Same values again: nothing changes, nothing is broadcast
        assert!(!manager
            .update_entry(&entry_id, ConfigEntryUpdate::new().title("New Name"))
            .unwrap());
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_unknown_entry() {
        let (_dir, manager) = create_test_manager();
        let result = manager.update_entry("missing", ConfigEntryUpdate::new().title("x"));
        assert!(matches!(result, Err(ConfigEntriesError::UnknownEntry(_))));
    }

    #[tokio::test]
    async fn test_update_touches_modified_at() {
        let (_dir, manager) = create_test_manager();
        let entry_id = insert(&manager, ConfigEntry::new("hue", "Bridge"));
        let before = manager.get_entry(&entry_id).unwrap().modified_at();

        let mut data = EntryData::new();
        data.insert("host".to_string(), serde_json::json!("10.0.0.9"));
        manager
            .update_entry(&entry_id, ConfigEntryUpdate::new().data(data))
            .unwrap();

        assert!(manager.get_entry(&entry_id).unwrap().modified_at() >= before);
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();
        assert_eq!(manager.len(), 1);

        let result = manager.remove(entry.entry_id()).await.unwrap();
        assert!(!result.require_restart);
        assert_eq!(manager.len(), 0);

        let missing = manager.remove(entry.entry_id()).await;
        assert!(matches!(missing, Err(ConfigEntriesError::UnknownEntry(_))));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::new());

        {
            let manager = ConfigEntries::new(
                Storage::new(temp_dir.path()),
                bus.clone(),
                ConfigEntriesSettings::default(),
            );
            manager
                .add(
                    ConfigEntry::new("hue", "Test")
                        .with_unique_id("test-123")
                        .with_source(ConfigEntrySource::Import),
                )
                .await
                .unwrap();
            manager.flush().await.unwrap();
        }

        let manager = ConfigEntries::new(
            Storage::new(temp_dir.path()),
            bus,
            ConfigEntriesSettings::default(),
        );
        manager.initialize().await.unwrap();

        assert_eq!(manager.len(), 1);
        let entry = manager.entry_for_domain_unique_id("hue", "test-123").unwrap();
        assert_eq!(entry.title(), "Test");
        assert_eq!(entry.source(), ConfigEntrySource::Import);
    }

    #[tokio::test]
    async fn test_core_state_events() {
        let (_dir, manager) = create_test_manager();
        let mut started = manager.bus().subscribe(HOMEASSISTANT_STARTED);

        manager.set_core_state(CoreState::Starting).await;
        manager.set_core_state(CoreState::Running).await;

        let event = started.recv().await.unwrap();
        assert_eq!(event.data["state"], "running");
        assert!(manager.core_state().is_running());
    }
}
