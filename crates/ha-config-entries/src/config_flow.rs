//! Config flow manager
//!
//! Starts configuration flows for integrations, tracks them while they run
//! and turns a finished flow into a config entry. Discovery flows raise a
//! (debounced) notification; reauth flows raise a repair issue.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ha_core::events::ConfigEntryDiscoveredData;
use ha_core::Context;
use ha_registries::{Issue, IssueSeverity};

use crate::debounce::Debouncer;
use crate::entry::{ConfigEntry, ConfigEntrySource, EntryData};
use crate::error::{ConfigEntriesError, ConfigEntriesResult, FlowError};
use crate::flow::{
    FlowContext, FlowContextMatch, FlowCore, FlowCx, FlowHandler, FlowOutcome, FlowProgress,
    FlowRecord, FlowResult, FlowResultType, DEFAULT_DISCOVERY_UNIQUE_ID,
};
use crate::manager::ConfigEntries;

pub const DISCOVERY_NOTIFICATION_ID: &str = "config_entry_discovery";
pub const RECONFIGURE_NOTIFICATION_ID: &str = "config_entry_reconfigure";

/// Domain that owns the reauth repair issues
pub const ISSUE_DOMAIN: &str = "homeassistant";

const DISCOVERY_TITLE: &str = "New devices discovered";
const DISCOVERY_MESSAGE: &str =
    "We have discovered new devices on your network. [Check it out](/config/integrations).";
const RECONFIGURE_TITLE: &str = "Integration requires reconfiguration";
const RECONFIGURE_MESSAGE: &str = "At least one of your integrations requires reconfiguration to \
     continue functioning. [Check it out](/config/integrations).";

pub(crate) fn reauth_issue_id(domain: &str, entry_id: &str) -> String {
    format!("config_entry_reauth_{domain}_{entry_id}")
}

type FlowFactory = Arc<dyn Fn() -> Box<dyn FlowHandler> + Send + Sync>;
type OptionsFlowFactory = Arc<dyn Fn(&ConfigEntry) -> Box<dyn FlowHandler> + Send + Sync>;

/// How to build flows for one domain
#[derive(Clone)]
pub struct FlowHandlerRegistration {
    domain: String,
    version: u32,
    minor_version: u32,
    single_config_entry: bool,
    supports_reconfigure: bool,
    factory: FlowFactory,
    options_factory: Option<OptionsFlowFactory>,
}

impl std::fmt::Debug for FlowHandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandlerRegistration")
            .field("domain", &self.domain)
            .field("version", &self.version)
            .field("minor_version", &self.minor_version)
            .field("single_config_entry", &self.single_config_entry)
            .finish()
    }
}

impl FlowHandlerRegistration {
    pub fn new<F, H>(domain: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: FlowHandler,
    {
        Self {
            domain: domain.into(),
            version: 1,
            minor_version: 1,
            single_config_entry: false,
            supports_reconfigure: false,
            factory: Arc::new(move || Box::new(factory()) as Box<dyn FlowHandler>),
            options_factory: None,
        }
    }

    /// Version given to entries this handler creates, and the target of
    /// migrations
    pub fn with_version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = version;
        self.minor_version = minor_version;
        self
    }

    pub fn single_config_entry(mut self, single: bool) -> Self {
        self.single_config_entry = single;
        self
    }

    pub fn supports_reconfigure(mut self, supported: bool) -> Self {
        self.supports_reconfigure = supported;
        self
    }

    pub fn with_options_flow<F, H>(mut self, factory: F) -> Self
    where
        F: Fn(&ConfigEntry) -> H + Send + Sync + 'static,
        H: FlowHandler,
    {
        self.options_factory = Some(Arc::new(move |entry: &ConfigEntry| {
            Box::new(factory(entry)) as Box<dyn FlowHandler>
        }));
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn minor_version(&self) -> u32 {
        self.minor_version
    }

    pub fn is_single_config_entry(&self) -> bool {
        self.single_config_entry
    }

    pub fn has_reconfigure(&self) -> bool {
        self.supports_reconfigure
    }

    pub fn supports_options(&self) -> bool {
        self.options_factory.is_some()
    }

    pub(crate) fn create_options_flow(&self, entry: &ConfigEntry) -> Option<Box<dyn FlowHandler>> {
        self.options_factory.as_ref().map(|factory| factory(entry))
    }
}

/// Steps every config flow has unless the handler provides its own
struct BuiltinSteps {
    inner: Box<dyn FlowHandler>,
}

#[async_trait]
impl FlowHandler for BuiltinSteps {
    async fn step(
        &mut self,
        flow: &FlowCx,
        step_id: &str,
        input: Option<serde_json::Value>,
    ) -> Result<FlowOutcome, FlowError> {
        match self.inner.step(flow, step_id, input.clone()).await {
            Err(FlowError::UnknownStep(_)) => {}
            other => return other,
        }

        match ConfigEntrySource::from_step(step_id) {
            Some(ConfigEntrySource::Ignore) => {
                let input = input.unwrap_or_default();
                let unique_id = input.get("unique_id").and_then(|v| v.as_str());
                let title = input
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or(flow.handler())
                    .to_string();
                flow.set_unique_id(unique_id, false)?;
                Ok(FlowOutcome::create_entry(title, EntryData::new()))
            }
            Some(ConfigEntrySource::User) | Some(ConfigEntrySource::Unignore) => {
                Ok(FlowOutcome::abort("not_implemented"))
            }
            Some(source) if source.is_discovery() => {
                flow.handle_discovery_without_unique_id()?;
                self.step(flow, ConfigEntrySource::User.as_str(), None).await
            }
            _ => Err(FlowError::UnknownStep(step_id.to_string())),
        }
    }
}

/// Manages the configuration flows of all integrations
pub struct ConfigEntriesFlowManager {
    hub: Weak<ConfigEntries>,
    core: FlowCore,
    handlers: dashmap::DashMap<String, FlowHandlerRegistration>,
    /// Import flows whose first step has not finished, per handler
    pending_imports: dashmap::DashMap<String, HashMap<String, watch::Sender<bool>>>,
    /// Cancelled at shutdown to interrupt initializing flows
    init_cancel: Mutex<CancellationToken>,
    discovery_debouncer: Debouncer,
}

impl std::fmt::Debug for ConfigEntriesFlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntriesFlowManager")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ConfigEntriesFlowManager {
    pub(crate) fn new(hub: Weak<ConfigEntries>, discovery_cooldown: std::time::Duration) -> Self {
        let debounce_hub = hub.clone();
        let discovery_debouncer = Debouncer::new(discovery_cooldown, true, move || {
            let Some(hub) = debounce_hub.upgrade() else {
                return;
            };
            hub.bus()
                .fire_typed(ConfigEntryDiscoveredData::default(), Context::new());
            hub.notifications().create(
                DISCOVERY_NOTIFICATION_ID,
                Some(DISCOVERY_TITLE),
                DISCOVERY_MESSAGE,
            );
        });

        Self {
            hub,
            core: FlowCore::default(),
            handlers: dashmap::DashMap::new(),
            pending_imports: dashmap::DashMap::new(),
            init_cancel: Mutex::new(CancellationToken::new()),
            discovery_debouncer,
        }
    }

    fn hub(&self) -> ConfigEntriesResult<Arc<ConfigEntries>> {
        self.hub.upgrade().ok_or(ConfigEntriesError::ManagerGone)
    }

    pub fn register_handler(&self, registration: FlowHandlerRegistration) {
        debug!(domain = %registration.domain, "Registered config flow handler");
        self.handlers
            .insert(registration.domain.clone(), registration);
    }

    pub fn registration(&self, handler: &str) -> Option<FlowHandlerRegistration> {
        self.handlers.get(handler).map(|r| r.value().clone())
    }

    pub fn progress(&self, include_uninitialized: bool) -> Vec<FlowProgress> {
        self.core.progress(include_uninitialized)
    }

    pub fn progress_by_handler(
        &self,
        handler: &str,
        match_context: Option<&FlowContextMatch>,
        include_uninitialized: bool,
    ) -> Vec<FlowProgress> {
        self.core
            .progress_by_handler(handler, match_context, include_uninitialized)
    }

    pub fn get(&self, flow_id: &str) -> Option<FlowProgress> {
        self.core.progress(true).into_iter().find(|p| p.flow_id == flow_id)
    }

    /// Start a configuration flow for `handler`
    pub async fn init(
        &self,
        handler: &str,
        context: FlowContext,
        data: Option<serde_json::Value>,
    ) -> ConfigEntriesResult<FlowResult> {
        let hub = self.hub()?;
        let registration = self
            .registration(handler)
            .ok_or_else(|| ConfigEntriesError::UnknownHandler(handler.to_string()))?;
        let flow_id = uuid::Uuid::new_v4().simple().to_string();

        if !matches!(
            context.source,
            ConfigEntrySource::Ignore | ConfigEntrySource::Reauth | ConfigEntrySource::Unignore
        ) && registration.single_config_entry
            && !hub.entries(Some(handler), false, true).is_empty()
        {
            return Ok(FlowResult::abort(flow_id, handler, "single_instance_allowed"));
        }

        let is_import = context.source == ConfigEntrySource::Import;
        if is_import {
            self.pending_imports
                .entry(handler.to_string())
                .or_default()
                .insert(flow_id.clone(), watch::channel(false).0);
        }

        let cancel = self.init_cancel_token();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.core.remove(&flow_id);
                Err(ConfigEntriesError::FlowCancelled)
            }
            outcome = self.init_flow(&hub, &registration, &flow_id, context, data) => outcome,
        };

        if is_import {
            self.mark_import_done(handler, &flow_id);
            if let Some(mut pending) = self.pending_imports.get_mut(handler) {
                pending.remove(&flow_id);
            }
        }

        let (record, result) = outcome?;
        if result.result_type != FlowResultType::Abort {
            self.post_init(&hub, &record);
        }
        Ok(result)
    }

    async fn init_flow(
        &self,
        hub: &Arc<ConfigEntries>,
        registration: &FlowHandlerRegistration,
        flow_id: &str,
        context: FlowContext,
        data: Option<serde_json::Value>,
    ) -> ConfigEntriesResult<(Arc<FlowRecord>, FlowResult)> {
        let handler = BuiltinSteps {
            inner: (registration.factory)(),
        };
        let init_step = context.source.as_str().to_string();
        let record = Arc::new(FlowRecord::new(
            flow_id.to_string(),
            registration.domain.clone(),
            registration.domain.clone(),
            context,
            init_step.clone(),
            registration.version,
            registration.minor_version,
            Box::new(handler),
        ));
        self.core.add(record.clone());

        let result = self.handle_step(hub, &record, &init_step, data).await;
        self.mark_import_done(&registration.domain, flow_id);

        match result {
            Ok(result) => Ok((record, result)),
            Err(err) => {
                self.core.remove(flow_id);
                Err(err)
            }
        }
    }

    /// Continue a flow with user input
    pub async fn configure(
        &self,
        flow_id: &str,
        input: Option<serde_json::Value>,
    ) -> ConfigEntriesResult<FlowResult> {
        let hub = self.hub()?;
        let record = self
            .core
            .get(flow_id)
            .ok_or_else(|| ConfigEntriesError::UnknownFlow(flow_id.to_string()))?;
        let step_id = record
            .cur_step()
            .ok_or_else(|| ConfigEntriesError::UnknownFlow(flow_id.to_string()))?;
        self.handle_step(&hub, &record, &step_id, input).await
    }

    /// Drop a flow in progress
    pub fn abort(&self, flow_id: &str) -> ConfigEntriesResult<()> {
        let record = self
            .core
            .remove(flow_id)
            .ok_or_else(|| ConfigEntriesError::UnknownFlow(flow_id.to_string()))?;
        debug!(flow_id, handler = %record.handler, "Aborted config flow");
        Ok(())
    }

    async fn handle_step(
        &self,
        hub: &Arc<ConfigEntries>,
        record: &Arc<FlowRecord>,
        step_id: &str,
        input: Option<serde_json::Value>,
    ) -> ConfigEntriesResult<FlowResult> {
        let result = self.core.run_step(hub, record, step_id, input).await?;
        if result.is_form() {
            record.set_cur_step(result.step_id.clone());
            return Ok(result);
        }

        let result = self.finish_flow(hub, record, result).await?;
        self.core.remove(&record.flow_id);
        Ok(result)
    }

    /// Wait until every import flow of `handler` has run its first step
    pub async fn wait_import_flow_initialized(&self, handler: &str) {
        let receivers: Vec<_> = match self.pending_imports.get(handler) {
            Some(pending) => pending.values().map(|tx| tx.subscribe()).collect(),
            None => return,
        };
        for mut rx in receivers {
            // A dropped sender means the flow finished initializing
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    /// Cancel initializing flows and stop discovery notifications
    pub fn shutdown(&self) {
        let token = {
            let mut current = self
                .init_cancel
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, CancellationToken::new())
        };
        token.cancel();
        self.discovery_debouncer.shutdown();
    }

    fn init_cancel_token(&self) -> CancellationToken {
        self.init_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn mark_import_done(&self, handler: &str, flow_id: &str) {
        if let Some(pending) = self.pending_imports.get(handler) {
            if let Some(tx) = pending.get(flow_id) {
                tx.send_replace(true);
            }
        }
    }

    fn has_other_flows(&self, flow_id: &str, predicate: impl Fn(&FlowContext) -> bool) -> bool {
        self.core
            .progress(true)
            .iter()
            .any(|p| p.flow_id != flow_id && predicate(&p.context))
    }

    fn post_init(&self, hub: &Arc<ConfigEntries>, record: &FlowRecord) {
        let source = record.context().source;
        if source.is_discovery() {
            self.discovery_debouncer.call();
        } else if source == ConfigEntrySource::Reauth {
            hub.notifications().create(
                RECONFIGURE_NOTIFICATION_ID,
                Some(RECONFIGURE_TITLE),
                RECONFIGURE_MESSAGE,
            );
        }
    }

    async fn finish_flow(
        &self,
        hub: &Arc<ConfigEntries>,
        record: &Arc<FlowRecord>,
        mut result: FlowResult,
    ) -> ConfigEntriesResult<FlowResult> {
        let context = record.context();
        self.mark_import_done(&record.handler, &record.flow_id);

        if !self.has_other_flows(&record.flow_id, |c| c.source.is_discovery()) {
            hub.notifications().dismiss(DISCOVERY_NOTIFICATION_ID);
        }

        if context.source == ConfigEntrySource::Reauth {
            if let Some(entry) = context.entry_id.as_deref().and_then(|id| hub.get_entry(id)) {
                hub.issues()
                    .delete(ISSUE_DOMAIN, &reauth_issue_id(entry.domain(), entry.entry_id()));
            }
        }

        if result.result_type != FlowResultType::CreateEntry {
            if result.is_abort()
                && context.source == ConfigEntrySource::Reauth
                && !self
                    .progress_by_handler(
                        &record.handler,
                        Some(&FlowContextMatch::source(ConfigEntrySource::Reauth)),
                        false,
                    )
                    .iter()
                    .any(|p| p.flow_id != record.flow_id)
            {
                hub.notifications().dismiss(RECONFIGURE_NOTIFICATION_ID);
            }
            return Ok(result);
        }

        let registration = self
            .registration(&record.handler)
            .ok_or_else(|| ConfigEntriesError::UnknownHandler(record.handler.clone()))?;

        if registration.single_config_entry
            && context.source != ConfigEntrySource::Ignore
            && !hub.entries(Some(&record.handler), false, true).is_empty()
        {
            return Ok(FlowResult::abort(
                &record.flow_id,
                &record.handler,
                "single_instance_allowed",
            ));
        }

        let unique_id = context.unique_id.clone();
        for progress in self.progress_by_handler(&record.handler, None, false) {
            if progress.flow_id == record.flow_id {
                continue;
            }
            let same_unique_id = unique_id.is_some() && progress.context.unique_id == unique_id;
            let placeholder =
                progress.context.unique_id.as_deref() == Some(DEFAULT_DISCOVERY_UNIQUE_ID);
            if same_unique_id || placeholder || registration.single_config_entry {
                let _ = self.abort(&progress.flow_id);
            }
        }

        let mut existing = None;
        let mut unique_id = unique_id;
        if unique_id.as_deref() == Some(DEFAULT_DISCOVERY_UNIQUE_ID) {
            record
                .context
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .unique_id = None;
            unique_id = None;
        } else if let Some(unique_id) = &unique_id {
            existing = hub.entry_for_domain_unique_id(&record.handler, unique_id);
        }

        // Unload now, remove only once the replacement is set up
        if let Some(existing) = &existing {
            if existing.state().is_recoverable() {
                hub.unload(existing.entry_id()).await?;
            }
        }

        let mut entry = ConfigEntry::new(&record.handler, result.title.clone().unwrap_or_default())
            .with_data(result.data.clone().unwrap_or_default())
            .with_options(result.options.clone().unwrap_or_default())
            .with_source(context.source)
            .with_version(
                result.version.unwrap_or(registration.version),
                result.minor_version.unwrap_or(registration.minor_version),
            );
        entry.unique_id = unique_id;
        let entry_id = entry.entry_id().to_string();

        hub.add(entry.clone()).await?;
        info!(domain = %record.handler, entry_id = %entry_id, source = %context.source, "Config flow created entry");

        if let Some(existing) = existing {
            hub.remove(existing.entry_id()).await?;
        }

        result.result = Some(hub.get_entry(&entry_id).unwrap_or(entry));
        Ok(result)
    }

    fn active_entry_flows(&self, entry: &ConfigEntry) -> bool {
        self.progress_by_handler(
            entry.domain(),
            Some(&FlowContextMatch::entry_id(entry.entry_id())),
            true,
        )
        .iter()
        .any(|p| {
            matches!(
                p.context.source,
                ConfigEntrySource::Reauth | ConfigEntrySource::Reconfigure
            )
        })
    }

    /// Start a reauth flow for the entry unless a reauth or reconfigure flow
    /// is already running for it
    pub(crate) fn start_reauth(
        &self,
        hub: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
        context: Option<FlowContext>,
        data: Option<EntryData>,
    ) {
        self.start_entry_flow(hub, entry, ConfigEntrySource::Reauth, context, data);
    }

    pub(crate) fn start_reconfigure(
        &self,
        hub: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
        context: Option<FlowContext>,
        data: Option<EntryData>,
    ) {
        self.start_entry_flow(hub, entry, ConfigEntrySource::Reconfigure, context, data);
    }

    fn start_entry_flow(
        &self,
        hub: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
        source: ConfigEntrySource,
        context: Option<FlowContext>,
        data: Option<EntryData>,
    ) {
        if self.active_entry_flows(entry) {
            debug!(entry_id = %entry.entry_id(), %source, "Flow already active for entry");
            return;
        }

        let mut flow_context = context.unwrap_or_else(|| FlowContext::new(source));
        flow_context.source = source;
        flow_context.entry_id = Some(entry.entry_id().to_string());
        flow_context
            .title_placeholders
            .entry("name".to_string())
            .or_insert_with(|| entry.title().to_string());
        if flow_context.unique_id.is_none() {
            flow_context.unique_id = entry.unique_id.clone();
        }

        let mut flow_data = entry.data().clone();
        flow_data.extend(data.unwrap_or_default());
        let flow_data = serde_json::to_value(flow_data).unwrap_or_default();

        let hub_task = hub.clone();
        let entry = entry.clone();
        hub.tasks.spawn(async move {
            let flow = hub_task.flow();
            let result = {
                let lock = match source {
                    ConfigEntrySource::Reauth => &entry.runtime.reauth_lock,
                    _ => &entry.runtime.reconfigure_lock,
                };
                let _guard = lock.lock().await;
                if flow.active_entry_flows(&entry) {
                    return;
                }
                flow.init(entry.domain(), flow_context, Some(flow_data)).await
            };

            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    warn!(entry_id = %entry.entry_id(), %source, "Could not start flow: {}", err);
                    return;
                }
            };

            if source == ConfigEntrySource::Reauth && result.is_form() {
                hub_task.issues().create(
                    Issue::new(
                        ISSUE_DOMAIN,
                        reauth_issue_id(entry.domain(), entry.entry_id()),
                        IssueSeverity::Error,
                    )
                    .with_issue_domain(entry.domain())
                    .with_translation_key("config_entry_reauth")
                    .with_placeholder("name", entry.title())
                    .with_data(serde_json::json!({ "flow_id": result.flow_id })),
                );
            }
        });
    }
}
