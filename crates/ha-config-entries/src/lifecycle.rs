//! Setup, unload and reload of config entries
//!
//! Every sequence that spans an await on one entry (setup, unload, reload,
//! removal, a fired retry) holds that entry's `setup_lock`. The public
//! operations take the lock; the `*_entry` helpers assume it is held.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::entry::{ConfigEntry, ConfigEntryChange, ConfigEntryState};
use crate::error::{ConfigEntriesError, ConfigEntriesResult, ConfigEntryError};
use crate::integration::{EntryContext, Integration};
use crate::manager::ConfigEntries;
use crate::runtime::{SharedReload, UnloadCallback};
use crate::state_machine::retry_delay;

const UNKNOWN_FATAL_REASON: &str = "Unknown fatal config entry error";
const AUTH_FAILED_REASON: &str = "could not authenticate";
const UNLOAD_NOT_SUPPORTED_REASON: &str = "Unload not supported";
const UNKNOWN_UNLOAD_REASON: &str = "Unknown error";

impl ConfigEntries {
    /// Set up an entry that is not loaded.
    ///
    /// Returns whether the entry ended up `Loaded`. Failures of the
    /// integration are recorded on the entry, not returned.
    #[instrument(skip(self), fields(domain = tracing::field::Empty))]
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self.require_entry(entry_id)?;
        tracing::Span::current().record("domain", entry.domain());

        ensure_not_loaded(&entry)?;

        self.flow().wait_import_flow_initialized(entry.domain()).await;

        let _guard = entry.runtime.setup_lock.lock().await;
        // A reload or retry holding the lock may have set the entry up meanwhile
        ensure_not_loaded(&self.require_entry(entry_id)?)?;
        self.setup_entry(entry_id).await?;
        Ok(self.get_entry(entry_id).is_some_and(|entry| entry.is_loaded()))
    }

    /// Unload an entry.
    ///
    /// Returns whether the unload was possible and succeeded. Entries in a
    /// non-recoverable state are refused.
    #[instrument(skip(self), fields(domain = tracing::field::Empty))]
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self.require_entry(entry_id)?;
        tracing::Span::current().record("domain", entry.domain());
        ensure_recoverable(&entry)?;

        let _guard = entry.runtime.setup_lock.lock().await;
        self.unload_entry(entry_id).await
    }

    /// Unload then set up an entry again.
    ///
    /// A disabled entry is only unloaded. Concurrent reloads of the same
    /// entry share one unload/setup pass and its result.
    #[instrument(skip(self), fields(domain = tracing::field::Empty))]
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self.require_entry(entry_id)?;
        tracing::Span::current().record("domain", entry.domain());

        let (generation, reload) = {
            let mut state = entry.runtime.lock();
            match &state.reload {
                Some((generation, reload)) => {
                    debug!(entry_id, "Joining reload already in progress");
                    (*generation, reload.clone())
                }
                None => {
                    state.reload_generation += 1;
                    let generation = state.reload_generation;
                    let reload = self.reload_future(entry_id)?;
                    state.reload = Some((generation, reload.clone()));
                    (generation, reload)
                }
            }
        };

        let result = reload.await;

        let mut state = entry.runtime.lock();
        if state
            .reload
            .as_ref()
            .is_some_and(|(current, _)| *current == generation)
        {
            state.reload = None;
        }
        result
    }

    fn reload_future(&self, entry_id: &str) -> ConfigEntriesResult<SharedReload> {
        let hub = Arc::downgrade(&self.arc()?);
        let entry_id = entry_id.to_string();
        Ok(async move {
            let hub = hub.upgrade().ok_or(ConfigEntriesError::ManagerGone)?;
            hub.reload_locked(&entry_id).await
        }
        .boxed()
        .shared())
    }

    async fn reload_locked(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self.require_entry(entry_id)?;
        let _guard = entry.runtime.setup_lock.lock().await;

        let entry = self.require_entry(entry_id)?;
        ensure_recoverable(&entry)?;

        let unloaded = self.unload_entry(entry_id).await?;
        let entry = self.require_entry(entry_id)?;
        if !unloaded || entry.is_disabled() {
            return Ok(unloaded);
        }

        self.setup_entry(entry_id).await?;
        Ok(self.get_entry(entry_id).is_some_and(|entry| entry.is_loaded()))
    }

    /// Reload in the background, cancelling any pending setup retry first
    pub fn schedule_reload(&self, entry_id: &str) {
        let Some(entry) = self.get_entry(entry_id) else {
            warn!(entry_id, "Cannot schedule reload of unknown config entry");
            return;
        };
        entry.runtime.cancel_retry();

        let Ok(hub) = self.arc() else {
            return;
        };
        let entry_id = entry_id.to_string();
        self.tasks.spawn(async move {
            if let Err(err) = hub.reload(&entry_id).await {
                warn!(entry_id = %entry_id, "Scheduled reload failed: {}", err);
            }
        });
    }

    /// Set up every entry at startup.
    ///
    /// Entries are set up concurrently; ignored and disabled entries are
    /// skipped. Returns `(entry_id, loaded)` per attempted entry.
    pub async fn setup_all(&self) -> Vec<(String, bool)> {
        let entries: Vec<ConfigEntry> = self
            .entries(None, false, false)
            .into_iter()
            .filter(|entry| entry.state() == ConfigEntryState::NotLoaded)
            .collect();
        info!("Setting up {} config entries", entries.len());

        join_all(entries.into_iter().map(|entry| async move {
            let loaded = match self.setup(entry.entry_id()).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(domain = %entry.domain, entry_id = %entry.entry_id, "Setup skipped: {}", err);
                    false
                }
            };
            (entry.entry_id, loaded)
        }))
        .await
    }

    /// Set up `platforms` for the entry using their own integrations.
    ///
    /// The entry's state belongs to its own domain and is not touched here.
    pub async fn forward_entry_setups(
        &self,
        entry_id: &str,
        platforms: &[&str],
    ) -> ConfigEntriesResult<()> {
        let entry = &self.require_entry(entry_id)?;
        let hub = self.arc()?;

        join_all(platforms.iter().map(|platform| {
            let cx = EntryContext::new(hub.clone(), entry.clone());
            async move {
                let Some(integration) = self.integration(platform) else {
                    warn!(domain = %entry.domain, platform, "Platform integration is not registered");
                    return;
                };
                match AssertUnwindSafe(integration.setup_entry(&cx)).catch_unwind().await {
                    Ok(Ok(true)) => {
                        debug!(domain = %entry.domain, entry_id = %entry.entry_id, platform, "Forwarded setup done");
                    }
                    Ok(Ok(false)) => {
                        warn!(domain = %entry.domain, entry_id = %entry.entry_id, platform, "Forwarded setup was not successful");
                    }
                    Ok(Err(err)) => {
                        error!(domain = %entry.domain, entry_id = %entry.entry_id, platform, "Error setting up platform: {}", err);
                    }
                    Err(_) => {
                        error!(domain = %entry.domain, entry_id = %entry.entry_id, platform, "Platform setup panicked");
                    }
                }
            }
        }))
        .await;
        Ok(())
    }

    /// Unload `platforms` for the entry. True only if every platform unloaded.
    pub async fn unload_platforms(
        &self,
        entry_id: &str,
        platforms: &[&str],
    ) -> ConfigEntriesResult<bool> {
        let entry = &self.require_entry(entry_id)?;
        let hub = self.arc()?;

        let results = join_all(platforms.iter().map(|platform| {
            let cx = EntryContext::new(hub.clone(), entry.clone());
            async move {
                let Some(integration) = self.integration(platform) else {
                    // Never loaded
                    return true;
                };
                if !integration.supports_unload() {
                    return false;
                }
                match AssertUnwindSafe(integration.unload_entry(&cx)).catch_unwind().await {
                    Ok(Ok(unloaded)) => unloaded,
                    Ok(Err(err)) => {
                        error!(domain = %entry.domain, entry_id = %entry.entry_id, platform, "Error unloading platform: {}", err);
                        false
                    }
                    Err(_) => {
                        error!(domain = %entry.domain, entry_id = %entry.entry_id, platform, "Platform unload panicked");
                        false
                    }
                }
            }
        }))
        .await;
        Ok(results.into_iter().all(|unloaded| unloaded))
    }

    /// Run the setup hook and record the outcome. Caller holds `setup_lock`.
    pub(crate) async fn setup_entry(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self.require_entry(entry_id)?;
        if entry.is_ignored() || entry.is_disabled() {
            return Ok(());
        }

        let Some(integration) = self.integration(entry.domain()) else {
            error!(domain = %entry.domain, entry_id, "No integration registered to set up config entry");
            return Ok(());
        };
        let hub = self.arc()?;

        if !self.set_state(entry_id, ConfigEntryState::SetupInProgress, None) {
            return Ok(());
        }
        self.cache_capabilities(entry_id, integration.as_ref());

        if !self.migrate_entry(&hub, &entry, &integration).await {
            self.set_state(entry_id, ConfigEntryState::MigrationError, None);
            return Ok(());
        }

        // Migration may have rewritten the entry
        let entry = self.require_entry(entry_id)?;
        let cx = EntryContext::new(hub.clone(), entry.clone());
        let outcome = AssertUnwindSafe(integration.setup_entry(&cx))
            .catch_unwind()
            .await;

        let error_reason = match outcome {
            Ok(Ok(true)) => {
                entry.runtime.cancel_retry();
                self.set_state(entry_id, ConfigEntryState::Loaded, None);
                info!(domain = %entry.domain, entry_id, title = %entry.title, "Config entry loaded");
                return Ok(());
            }
            Ok(Ok(false)) => {
                warn!(domain = %entry.domain, entry_id, "Config entry setup was not successful");
                None
            }
            Ok(Err(ConfigEntryError::Fatal(message))) => {
                let reason = non_empty_or(message, UNKNOWN_FATAL_REASON);
                error!(domain = %entry.domain, entry_id, title = %entry.title, "Error setting up entry: {}", reason);
                self.process_on_unload(&entry).await;
                Some(reason)
            }
            Ok(Err(ConfigEntryError::AuthFailed(message))) => {
                let auth_message = if message.is_empty() {
                    AUTH_FAILED_REASON.to_string()
                } else {
                    format!("{}: {}", AUTH_FAILED_REASON, message)
                };
                warn!(domain = %entry.domain, entry_id, title = %entry.title, "Config entry {}", auth_message);
                self.process_on_unload(&entry).await;
                self.flow().start_reauth(&hub, &entry, None, None);
                Some(non_empty_or(message, AUTH_FAILED_REASON))
            }
            Ok(Err(ConfigEntryError::NotReady(message))) => {
                self.schedule_retry(&hub, &entry, message);
                self.process_on_unload(&entry).await;
                return Ok(());
            }
            Ok(Err(ConfigEntryError::Other(message))) => {
                error!(domain = %entry.domain, entry_id, title = %entry.title, "Error setting up entry: {}", message);
                None
            }
            Err(_) => {
                error!(domain = %entry.domain, entry_id, title = %entry.title, "Config entry setup panicked");
                None
            }
        };

        entry.runtime.cancel_retry();
        self.set_state(entry_id, ConfigEntryState::SetupError, error_reason);
        Ok(())
    }

    fn cache_capabilities(&self, entry_id: &str, integration: &dyn Integration) {
        let mut items = self.write_items();
        if let Some(entry) = items.get_mut(entry_id) {
            entry
                .supports_unload
                .get_or_insert(integration.supports_unload());
            entry
                .supports_remove_device
                .get_or_insert(integration.supports_remove_device());
        }
    }

    /// Bring the entry to the version of its flow handler. True when the
    /// entry is current (or was migrated).
    async fn migrate_entry(
        &self,
        hub: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
        integration: &Arc<dyn Integration>,
    ) -> bool {
        let Some(registration) = self.flow().registration(entry.domain()) else {
            error!(domain = %entry.domain, entry_id = %entry.entry_id, "Flow handler not found for config entry");
            return false;
        };

        let same_major_version = entry.version() == registration.version();
        if same_major_version && entry.minor_version() == registration.minor_version() {
            return true;
        }

        if !integration.supports_migrate() {
            if same_major_version {
                return true;
            }
            error!(domain = %entry.domain, entry_id = %entry.entry_id, "Migration handler not found for config entry");
            return false;
        }

        info!(
            domain = %entry.domain,
            entry_id = %entry.entry_id,
            from = %format!("{}.{}", entry.version(), entry.minor_version()),
            to = %format!("{}.{}", registration.version(), registration.minor_version()),
            "Migrating config entry"
        );
        let cx = EntryContext::new(hub.clone(), entry.clone());
        match AssertUnwindSafe(integration.migrate_entry(&cx))
            .catch_unwind()
            .await
        {
            Ok(Ok(true)) => {
                self.schedule_save();
                true
            }
            Ok(Ok(false)) => false,
            Ok(Err(err)) => {
                error!(domain = %entry.domain, entry_id = %entry.entry_id, "Error migrating config entry: {}", err);
                false
            }
            Err(_) => {
                error!(domain = %entry.domain, entry_id = %entry.entry_id, "Config entry migration panicked");
                false
            }
        }
    }

    /// Put the entry in SetupRetry and arm the next attempt
    fn schedule_retry(&self, hub: &Arc<ConfigEntries>, entry: &ConfigEntry, message: String) {
        let entry_id = entry.entry_id();
        let reason = (!message.is_empty()).then(|| message.clone());
        self.set_state(entry_id, ConfigEntryState::SetupRetry, reason);

        let tries = {
            let mut items = self.write_items();
            match items.get_mut(entry_id) {
                Some(current) => {
                    let tries = current.tries;
                    current.tries += 1;
                    tries
                }
                None => return,
            }
        };
        let settings = self.settings();
        let wait = retry_delay(tries, settings.retry_base, settings.retry_max_exponent);

        let ready_message = if message.is_empty() {
            "ready yet".to_string()
        } else {
            format!("ready yet: {}", message)
        };
        debug!(
            domain = %entry.domain,
            entry_id,
            title = %entry.title,
            "Config entry not {}; Retrying in {:.0} seconds",
            ready_message,
            wait.as_secs_f64()
        );

        let cancel = CancellationToken::new();
        let retry_id = entry.runtime.set_retry(cancel.clone(), wait);
        let runtime = entry.runtime.clone();
        let weak = Arc::downgrade(hub);
        let shutdown = self.shutdown.clone();
        let mut core_state = self.watch_core_state();
        let entry_id = entry_id.to_string();

        tokio::spawn(async move {
            let due = async {
                if core_state.borrow().is_running() {
                    tokio::time::sleep(wait).await;
                } else {
                    // Before startup completes, retry as soon as it does
                    let _ = core_state.wait_for(|state| state.is_running()).await;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shutdown.cancelled() => return,
                _ = due => {}
            }

            runtime.clear_retry(retry_id);
            let Some(hub) = weak.upgrade() else {
                return;
            };
            if hub.core_state().is_stopping() {
                return;
            }
            let tasks = hub.tasks.clone();
            tasks.spawn(async move { hub.setup_again(&entry_id).await });
        });
    }

    async fn setup_again(&self, entry_id: &str) {
        let Some(entry) = self.get_entry(entry_id) else {
            return;
        };
        let _guard = entry.runtime.setup_lock.lock().await;
        let still_waiting = self
            .get_entry(entry_id)
            .is_some_and(|entry| entry.state() == ConfigEntryState::SetupRetry);
        if !still_waiting {
            return;
        }
        if let Err(err) = self.setup_entry(entry_id).await {
            warn!(entry_id, "Setup retry failed: {}", err);
        }
    }

    /// Run the unload hook and record the outcome. Caller holds `setup_lock`.
    pub(crate) async fn unload_entry(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self.require_entry(entry_id)?;

        if entry.is_ignored() {
            self.set_state(entry_id, ConfigEntryState::NotLoaded, None);
            return Ok(true);
        }
        if entry.state() == ConfigEntryState::NotLoaded {
            return Ok(true);
        }

        let Some(integration) = self.integration(entry.domain()) else {
            // Uninstalled or renamed integration
            self.set_state(entry_id, ConfigEntryState::NotLoaded, None);
            return Ok(true);
        };

        if !entry.state().is_recoverable() {
            return Ok(false);
        }
        if entry.state() != ConfigEntryState::Loaded {
            entry.runtime.cancel_retry();
            self.set_state(entry_id, ConfigEntryState::NotLoaded, None);
            return Ok(true);
        }

        if !integration.supports_unload() {
            self.set_state(
                entry_id,
                ConfigEntryState::FailedUnload,
                Some(UNLOAD_NOT_SUPPORTED_REASON.to_string()),
            );
            return Ok(false);
        }

        let cx = EntryContext::new(self.arc()?, entry.clone());
        match AssertUnwindSafe(integration.unload_entry(&cx))
            .catch_unwind()
            .await
        {
            Ok(Ok(unloaded)) => {
                if unloaded {
                    self.set_state(entry_id, ConfigEntryState::NotLoaded, None);
                    info!(domain = %entry.domain, entry_id, "Config entry unloaded");
                } else {
                    warn!(domain = %entry.domain, entry_id, "Integration refused to unload config entry");
                }
                self.process_on_unload(&entry).await;
                Ok(unloaded)
            }
            Ok(Err(err)) => {
                error!(domain = %entry.domain, entry_id, title = %entry.title, "Error unloading entry: {}", err);
                let reason = match err {
                    ConfigEntryError::NotReady(message)
                    | ConfigEntryError::AuthFailed(message)
                    | ConfigEntryError::Fatal(message)
                    | ConfigEntryError::Other(message) => non_empty_or(message, UNKNOWN_UNLOAD_REASON),
                };
                self.set_state(entry_id, ConfigEntryState::FailedUnload, Some(reason));
                Ok(false)
            }
            Err(_) => {
                error!(domain = %entry.domain, entry_id, title = %entry.title, "Config entry unload panicked");
                self.set_state(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some(UNKNOWN_UNLOAD_REASON.to_string()),
                );
                Ok(false)
            }
        }
    }

    /// Run unload callbacks (newest first), cancel background tasks and wait
    /// for the entry's tasks up to the unload timeout
    pub(crate) async fn process_on_unload(&self, entry: &ConfigEntry) {
        for callback in entry.runtime.take_on_unload() {
            match callback {
                UnloadCallback::Sync(callback) => {
                    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                        error!(domain = %entry.domain, entry_id = %entry.entry_id, "Unload callback panicked");
                    }
                }
                UnloadCallback::Async(callback) => {
                    let handle = self.tasks.spawn(callback());
                    entry
                        .runtime
                        .push_task("on_unload".to_string(), handle, false);
                }
            }
        }

        let (tasks, background_tasks) = entry.runtime.take_tasks();
        if tasks.is_empty() && background_tasks.is_empty() {
            return;
        }
        for task in &background_tasks {
            task.handle.abort();
        }

        let deadline = Instant::now() + self.settings().unload_timeout();
        for mut task in tasks.into_iter().chain(background_tasks) {
            if tokio::time::timeout_at(deadline, &mut task.handle).await.is_err() {
                warn!(
                    domain = %entry.domain,
                    entry_id = %entry.entry_id,
                    task = %task.name,
                    "Unloading config entry; task did not complete in time"
                );
            }
        }
    }

    /// Set the entry's state and reason and broadcast the change.
    ///
    /// Transitions the state machine does not allow are logged and dropped.
    /// Returns whether the state was applied.
    pub(crate) fn set_state(&self, entry_id: &str, state: ConfigEntryState, reason: Option<String>) -> bool {
        let entry = {
            let mut items = self.write_items();
            let Some(entry) = items.get_mut(entry_id) else {
                return false;
            };
            if entry.state != state {
                if let Err(err) = entry.state.try_transition(state) {
                    error!(domain = %entry.domain, entry_id, "{}", err);
                    return false;
                }
            }
            if !state.keeps_tries() {
                entry.tries = 0;
            }
            entry.state = state;
            entry.reason = reason;
            entry.clone()
        };
        debug!(domain = %entry.domain, entry_id, state = %state, "Config entry state changed");
        self.dispatch(ConfigEntryChange::Updated, entry);
        true
    }

    fn require_entry(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        self.get_entry(entry_id)
            .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))
    }

    /// Delay the pending setup retry of an entry would wait, if one is armed
    pub fn retry_wait(&self, entry_id: &str) -> Option<Duration> {
        self.get_entry(entry_id)?.runtime.retry_wait()
    }

    /// Number of the entry's own tasks still running
    pub fn pending_entry_tasks(&self, entry_id: &str) -> usize {
        self.get_entry(entry_id)
            .map(|entry| entry.runtime.pending_task_count())
            .unwrap_or(0)
    }
}

fn ensure_not_loaded(entry: &ConfigEntry) -> ConfigEntriesResult<()> {
    if entry.state() == ConfigEntryState::NotLoaded {
        return Ok(());
    }
    Err(ConfigEntriesError::OperationNotAllowed(format!(
        "The config entry {} ({}) with entry_id {} cannot be set up because it is already loaded in the {} state",
        entry.title(),
        entry.domain(),
        entry.entry_id(),
        entry.state()
    )))
}

fn ensure_recoverable(entry: &ConfigEntry) -> ConfigEntriesResult<()> {
    if entry.state().is_recoverable() {
        return Ok(());
    }
    Err(ConfigEntriesError::OperationNotAllowed(format!(
        "The config entry {} ({}) with entry_id {} cannot be unloaded because it is not in a recoverable state ({})",
        entry.title(),
        entry.domain(),
        entry.entry_id(),
        entry.state()
    )))
}

fn non_empty_or(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
