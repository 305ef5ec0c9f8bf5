//! Integration hooks
//!
//! An [`Integration`] is the code behind a domain. The manager calls its
//! hooks during setup, unload, migration and removal; the hook receives an
//! [`EntryContext`] for the entry being processed.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

use crate::entry::ConfigEntry;
use crate::error::{ConfigEntriesResult, ConfigEntryError};
use crate::manager::ConfigEntries;
use crate::runtime::{EntryRuntime, UnloadCallback};

/// The hooks an integration provides for its config entries.
///
/// Only `setup_entry` is required. The `supports_*` methods tell the manager
/// whether the matching hook is implemented.
#[async_trait]
pub trait Integration: Send + Sync + 'static {
    fn domain(&self) -> &str;

    /// Set up the entry. `Ok(false)` puts the entry in SetupError.
    async fn setup_entry(&self, cx: &EntryContext) -> Result<bool, ConfigEntryError>;

    fn supports_unload(&self) -> bool {
        false
    }

    async fn unload_entry(&self, _cx: &EntryContext) -> Result<bool, ConfigEntryError> {
        Ok(false)
    }

    fn supports_migrate(&self) -> bool {
        false
    }

    /// Bring the entry to the current version, via
    /// [`ConfigEntries::update_entry`]. `Ok(false)` means the migration failed.
    async fn migrate_entry(&self, _cx: &EntryContext) -> Result<bool, ConfigEntryError> {
        Ok(false)
    }

    fn supports_remove_entry(&self) -> bool {
        false
    }

    /// Clean up after the entry was removed
    async fn remove_entry(&self, _entry: &ConfigEntry) -> Result<(), ConfigEntryError> {
        Ok(())
    }

    fn supports_remove_device(&self) -> bool {
        false
    }
}

/// What an integration hook sees of the entry it is working on
#[derive(Clone)]
pub struct EntryContext {
    hub: Arc<ConfigEntries>,
    entry: ConfigEntry,
    runtime: Arc<EntryRuntime>,
}

impl std::fmt::Debug for EntryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryContext")
            .field("entry", &self.entry)
            .finish()
    }
}

impl EntryContext {
    pub(crate) fn new(hub: Arc<ConfigEntries>, entry: ConfigEntry) -> Self {
        let runtime = entry.runtime.clone();
        Self {
            hub,
            entry,
            runtime,
        }
    }

    /// The entry as it was when the hook was called
    pub fn entry(&self) -> &ConfigEntry {
        &self.entry
    }

    pub fn entry_id(&self) -> &str {
        &self.entry.entry_id
    }

    /// The entry as it is now, if it still exists
    pub fn current(&self) -> Option<ConfigEntry> {
        self.hub.get_entry(&self.entry.entry_id)
    }

    pub fn config_entries(&self) -> &Arc<ConfigEntries> {
        &self.hub
    }

    /// Run `callback` when the entry unloads or its setup fails
    pub fn on_unload<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime
            .push_on_unload(UnloadCallback::Sync(Box::new(callback)));
    }

    pub fn on_unload_async<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.runtime
            .push_on_unload(UnloadCallback::Async(Box::new(move || callback().boxed())));
    }

    /// Spawn a task owned by the entry. Unload waits for it, up to the
    /// unload timeout.
    pub fn create_task<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.hub.tasks.spawn(future);
        self.runtime.push_task(name.into(), handle, false);
    }

    /// Spawn a long-running task owned by the entry. Unload cancels it.
    pub fn create_background_task<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.runtime.push_task(name.into(), handle, true);
    }

    /// Call `listener` after every change to the entry. Returns an id for
    /// [`EntryContext::remove_update_listener`].
    pub fn add_update_listener<F, Fut>(&self, listener: F) -> u64
    where
        F: Fn(Arc<ConfigEntries>, ConfigEntry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.runtime.add_update_listener(Arc::new(
            move |hub: Arc<ConfigEntries>, entry: ConfigEntry| -> BoxFuture<'static, ()> {
                listener(hub, entry).boxed()
            },
        ))
    }

    pub fn remove_update_listener(&self, id: u64) {
        self.runtime.remove_update_listener(id);
    }

    /// Set up platform integrations for this entry
    pub async fn forward_entry_setups(&self, platforms: &[&str]) -> ConfigEntriesResult<()> {
        self.hub
            .forward_entry_setups(&self.entry.entry_id, platforms)
            .await
    }

    pub async fn unload_platforms(&self, platforms: &[&str]) -> ConfigEntriesResult<bool> {
        self.hub
            .unload_platforms(&self.entry.entry_id, platforms)
            .await
    }
}
