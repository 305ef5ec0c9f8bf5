//! Shared mocks for the config entries integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ha_config::ConfigEntriesSettings;
use ha_config_entries::{
    ConfigEntries, ConfigEntry, ConfigEntryError, ConfigEntryUpdate, EntryContext, EntryData,
    FlowCx, FlowError, FlowHandler, FlowHandlerRegistration, FlowOutcome, Integration,
};
use ha_event_bus::EventBus;
use ha_registries::Storage;
use serde_json::Value;
use tempfile::TempDir;

/// What a mocked hook does when called
#[derive(Debug, Clone)]
pub enum Hook {
    Return(bool),
    Fail(ConfigEntryError),
    Panic,
}

impl Hook {
    fn run(self) -> Result<bool, ConfigEntryError> {
        match self {
            Hook::Return(result) => Ok(result),
            Hook::Fail(err) => Err(err),
            Hook::Panic => panic!("mock hook panicked"),
        }
    }
}

type SetupCallback = Arc<dyn Fn(&EntryContext) + Send + Sync>;

/// Integration with scripted hook outcomes and call counters
pub struct MockIntegration {
    domain: String,
    setup_script: Mutex<VecDeque<Hook>>,
    default_setup: Hook,
    unload: Option<Hook>,
    migrate: Option<(Hook, u32, u32)>,
    supports_remove: bool,
    setup_delay: Duration,
    on_setup: Option<SetupCallback>,
    pub setup_calls: AtomicUsize,
    pub unload_calls: AtomicUsize,
    pub migrate_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
}

impl MockIntegration {
    /// Setup succeeds, unload is supported and succeeds
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            setup_script: Mutex::new(VecDeque::new()),
            default_setup: Hook::Return(true),
            unload: Some(Hook::Return(true)),
            migrate: None,
            supports_remove: false,
            setup_delay: Duration::ZERO,
            on_setup: None,
            setup_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            migrate_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
        }
    }

    /// Outcomes for the next setup calls, in order; later calls use the default
    pub fn with_setup_script(self, script: Vec<Hook>) -> Self {
        *self.setup_script.lock().unwrap() = script.into();
        self
    }

    pub fn with_default_setup(mut self, hook: Hook) -> Self {
        self.default_setup = hook;
        self
    }

    /// `None` removes the unload hook
    pub fn with_unload(mut self, hook: Option<Hook>) -> Self {
        self.unload = hook;
        self
    }

    /// A migrate hook that bumps the entry to `version.minor` when it succeeds
    pub fn with_migrate(mut self, hook: Hook, version: u32, minor_version: u32) -> Self {
        self.migrate = Some((hook, version, minor_version));
        self
    }

    pub fn with_remove_hook(mut self) -> Self {
        self.supports_remove = true;
        self
    }

    pub fn with_setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = delay;
        self
    }

    pub fn with_on_setup(mut self, callback: impl Fn(&EntryContext) + Send + Sync + 'static) -> Self {
        self.on_setup = Some(Arc::new(callback));
        self
    }

    pub fn setups(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }

    pub fn migrations(&self) -> usize {
        self.migrate_calls.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Integration for MockIntegration {
    fn domain(&self) -> &str {
        &self.domain
    }

    async fn setup_entry(&self, cx: &EntryContext) -> Result<bool, ConfigEntryError> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        if !self.setup_delay.is_zero() {
            tokio::time::sleep(self.setup_delay).await;
        }
        if let Some(callback) = &self.on_setup {
            callback(cx);
        }
        let hook = self
            .setup_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_setup.clone());
        hook.run()
    }

    fn supports_unload(&self) -> bool {
        self.unload.is_some()
    }

    async fn unload_entry(&self, _cx: &EntryContext) -> Result<bool, ConfigEntryError> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        self.unload.clone().unwrap_or(Hook::Return(false)).run()
    }

    fn supports_migrate(&self) -> bool {
        self.migrate.is_some()
    }

    async fn migrate_entry(&self, cx: &EntryContext) -> Result<bool, ConfigEntryError> {
        self.migrate_calls.fetch_add(1, Ordering::SeqCst);
        let Some((hook, version, minor_version)) = self.migrate.clone() else {
            return Ok(false);
        };
        let migrated = hook.run()?;
        if migrated {
            cx.config_entries()
                .update_entry(
                    cx.entry_id(),
                    ConfigEntryUpdate::new().version(version, minor_version),
                )
                .map_err(|err| ConfigEntryError::Other(err.to_string()))?;
        }
        Ok(migrated)
    }

    fn supports_remove_entry(&self) -> bool {
        self.supports_remove
    }

    async fn remove_entry(&self, _entry: &ConfigEntry) -> Result<(), ConfigEntryError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config flow covering user, discovery, import, reauth and reconfigure steps.
///
/// User and import input carries `title`, optional `unique_id` and the entry
/// data under `data`. `replace: true` finishes even when an entry already has
/// the unique id, so the new entry replaces it.
#[derive(Default)]
pub struct MockFlow;

fn input_str<'a>(input: &'a Option<Value>, key: &str) -> Option<&'a str> {
    input.as_ref().and_then(|input| input.get(key)).and_then(Value::as_str)
}

fn input_data(input: &Option<Value>) -> EntryData {
    input
        .as_ref()
        .and_then(|input| input.get("data"))
        .and_then(|data| serde_json::from_value(data.clone()).ok())
        .unwrap_or_default()
}

#[async_trait]
impl FlowHandler for MockFlow {
    async fn step(
        &mut self,
        flow: &FlowCx,
        step_id: &str,
        input: Option<Value>,
    ) -> Result<FlowOutcome, FlowError> {
        match step_id {
            "user" | "import" => {
                if input.is_none() {
                    return Ok(FlowOutcome::form("user"));
                }
                if let Some(unique_id) = input_str(&input, "unique_id") {
                    flow.set_unique_id(Some(unique_id), true)?;
                    let replace = input
                        .as_ref()
                        .and_then(|input| input.get("replace"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if !replace {
                        flow.abort_if_unique_id_configured(None, true)?;
                    }
                }
                let title = input_str(&input, "title").unwrap_or("Mock").to_string();
                Ok(FlowOutcome::create_entry(title, input_data(&input)))
            }
            "zeroconf" => {
                let unique_id = input_str(&input, "unique_id").map(str::to_string);
                flow.set_unique_id(unique_id.as_deref(), true)?;
                let updates = input_data(&input);
                flow.abort_if_unique_id_configured(Some(updates), true)?;
                flow.set_title_placeholder("name", "Discovered");
                Ok(FlowOutcome::form("confirm"))
            }
            "confirm" => {
                if input.is_none() {
                    return Ok(FlowOutcome::form("confirm"));
                }
                Ok(FlowOutcome::create_entry("Discovered", input_data(&input)))
            }
            "hardware" => {
                // Slow handshake, only finishes if nobody cancels it
                tokio::time::sleep(Duration::from_secs(1000)).await;
                Ok(FlowOutcome::form("confirm"))
            }
            "reauth" => Ok(FlowOutcome::form("reauth_confirm")),
            "reauth_confirm" => {
                let Some(entry) = flow.config_entry() else {
                    return Err(FlowError::abort("entry_gone"));
                };
                let mut data = entry.data().clone();
                data.extend(input_data(&input));
                Ok(flow.update_reload_and_abort(
                    entry.entry_id(),
                    ConfigEntryUpdate::new().data(data),
                    "reauth_successful",
                ))
            }
            "reconfigure" => Ok(FlowOutcome::form("reconfigure")),
            _ => Err(FlowError::UnknownStep(step_id.to_string())),
        }
    }
}

/// Options flow: shows `init`, then stores the submitted map as options
#[derive(Default)]
pub struct MockOptionsFlow;

#[async_trait]
impl FlowHandler for MockOptionsFlow {
    async fn step(
        &mut self,
        _flow: &FlowCx,
        step_id: &str,
        input: Option<Value>,
    ) -> Result<FlowOutcome, FlowError> {
        match (step_id, input) {
            ("init", None) => Ok(FlowOutcome::form("init")),
            ("init", Some(input)) => {
                let options: EntryData = serde_json::from_value(input)
                    .map_err(|err| FlowError::Other(err.to_string()))?;
                Ok(FlowOutcome::create_entry("", options))
            }
            _ => Err(FlowError::UnknownStep(step_id.to_string())),
        }
    }
}

pub fn settings() -> ConfigEntriesSettings {
    ConfigEntriesSettings {
        unload_timeout: 1.0,
        ..ConfigEntriesSettings::default()
    }
}

pub fn create_hub() -> (TempDir, Arc<ConfigEntries>) {
    let temp_dir = TempDir::new().unwrap();
    let hub = ConfigEntries::new(
        Storage::new(temp_dir.path()),
        Arc::new(EventBus::new()),
        settings(),
    );
    (temp_dir, hub)
}

/// Register `integration` and a matching version 1.1 flow handler
pub fn register(hub: &ConfigEntries, integration: MockIntegration) -> Arc<MockIntegration> {
    register_with(hub, integration, |registration| registration)
}

pub fn register_with(
    hub: &ConfigEntries,
    integration: MockIntegration,
    customize: impl FnOnce(FlowHandlerRegistration) -> FlowHandlerRegistration,
) -> Arc<MockIntegration> {
    let integration = Arc::new(integration);
    let registration = FlowHandlerRegistration::new(integration.domain().to_string(), || MockFlow)
        .with_options_flow(|_entry: &ConfigEntry| MockOptionsFlow);
    hub.register_flow_handler(customize(registration));
    hub.register_integration(integration.clone());
    integration
}

pub fn data(pairs: &[(&str, Value)]) -> EntryData {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
