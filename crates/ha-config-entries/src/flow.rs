//! Flow engine shared by config flows and options flows
//!
//! A flow is a small state machine driven by user input: each step returns
//! a form (wait for more input), a created entry or an abort. Flow handlers
//! implement [`FlowHandler`]; the managers keep the in-progress flows and
//! decide what finishing a flow means.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::entry::{ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate, EntryData};
use crate::error::{ConfigEntriesError, ConfigEntriesResult, FlowError};
use crate::manager::ConfigEntries;

/// Placeholder unique id for discoveries that carry no identifier
pub const DEFAULT_DISCOVERY_UNIQUE_ID: &str = "default_discovery_unique_id";

/// Context attached to a flow when it starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub source: ConfigEntrySource,
    #[serde(default)]
    pub unique_id: Option<String>,
    /// Entry the flow works on (reauth, reconfigure, options)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub title_placeholders: HashMap<String, String>,
    #[serde(default)]
    pub confirm_only: bool,
    #[serde(default)]
    pub show_advanced_options: bool,
}

impl FlowContext {
    pub fn new(source: ConfigEntrySource) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }

    pub fn with_title_placeholder(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.title_placeholders.insert(name.into(), value.into());
        self
    }
}

/// Filter for flows in progress; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowContextMatch {
    pub source: Option<ConfigEntrySource>,
    pub unique_id: Option<String>,
    pub entry_id: Option<String>,
}

impl FlowContextMatch {
    pub fn source(source: ConfigEntrySource) -> Self {
        Self {
            source: Some(source),
            ..Default::default()
        }
    }

    pub fn unique_id(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: Some(unique_id.into()),
            ..Default::default()
        }
    }

    pub fn entry_id(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: Some(entry_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, context: &FlowContext) -> bool {
        self.source.map_or(true, |source| context.source == source)
            && self
                .unique_id
                .as_ref()
                .map_or(true, |unique_id| context.unique_id.as_ref() == Some(unique_id))
            && self
                .entry_id
                .as_ref()
                .map_or(true, |entry_id| context.entry_id.as_ref() == Some(entry_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// What a flow step decided
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    Form {
        step_id: String,
        errors: HashMap<String, String>,
        description_placeholders: HashMap<String, String>,
    },
    CreateEntry {
        title: String,
        data: EntryData,
        options: EntryData,
    },
    Abort {
        reason: String,
        description_placeholders: HashMap<String, String>,
    },
}

impl FlowOutcome {
    /// Show a form and wait for input to `step_id`
    pub fn form(step_id: impl Into<String>) -> Self {
        Self::Form {
            step_id: step_id.into(),
            errors: HashMap::new(),
            description_placeholders: HashMap::new(),
        }
    }

    pub fn create_entry(title: impl Into<String>, data: EntryData) -> Self {
        Self::CreateEntry {
            title: title.into(),
            data,
            options: EntryData::new(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
            description_placeholders: HashMap::new(),
        }
    }

    /// Attach a form error, keyed by field (`base` for the whole form)
    pub fn with_error(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        if let Self::Form { errors, .. } = &mut self {
            errors.insert(field.into(), error.into());
        }
        self
    }

    pub fn with_options(mut self, new_options: EntryData) -> Self {
        if let Self::CreateEntry { options, .. } = &mut self {
            *options = new_options;
        }
        self
    }

    pub fn with_placeholder(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self {
            Self::Form {
                description_placeholders,
                ..
            }
            | Self::Abort {
                description_placeholders,
                ..
            } => {
                description_placeholders.insert(name.into(), value.into());
            }
            Self::CreateEntry { .. } => {}
        }
        self
    }
}

/// Result of initializing or configuring a flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub description_placeholders: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EntryData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<EntryData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u32>,
    /// The entry a finished config flow created
    #[serde(skip)]
    pub result: Option<ConfigEntry>,
}

impl FlowResult {
    pub(crate) fn abort(
        flow_id: impl Into<String>,
        handler: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            handler: handler.into(),
            result_type: FlowResultType::Abort,
            step_id: None,
            errors: HashMap::new(),
            description_placeholders: HashMap::new(),
            title: None,
            data: None,
            options: None,
            reason: Some(reason.into()),
            version: None,
            minor_version: None,
            result: None,
        }
    }

    fn from_outcome(record: &FlowRecord, outcome: FlowOutcome) -> Self {
        let mut result = Self::abort(&record.flow_id, &record.handler, "");
        result.reason = None;
        match outcome {
            FlowOutcome::Form {
                step_id,
                errors,
                description_placeholders,
            } => {
                result.result_type = FlowResultType::Form;
                result.step_id = Some(step_id);
                result.errors = errors;
                result.description_placeholders = description_placeholders;
            }
            FlowOutcome::CreateEntry {
                title,
                data,
                options,
            } => {
                result.result_type = FlowResultType::CreateEntry;
                result.title = Some(title);
                result.data = Some(data);
                result.options = Some(options);
                result.version = Some(record.version);
                result.minor_version = Some(record.minor_version);
            }
            FlowOutcome::Abort {
                reason,
                description_placeholders,
            } => {
                result.reason = Some(reason);
                result.description_placeholders = description_placeholders;
            }
        }
        result
    }

    pub fn is_form(&self) -> bool {
        self.result_type == FlowResultType::Form
    }

    pub fn is_create_entry(&self) -> bool {
        self.result_type == FlowResultType::CreateEntry
    }

    pub fn is_abort(&self) -> bool {
        self.result_type == FlowResultType::Abort
    }
}

/// Summary of a flow in progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowProgress {
    pub flow_id: String,
    pub handler: String,
    pub context: FlowContext,
    /// Last form shown, `None` while the first step is still running
    pub step_id: Option<String>,
}

/// A configuration or options flow
#[async_trait]
pub trait FlowHandler: Send + 'static {
    /// Run `step_id`. `input` is the init data for the first step and the
    /// user's answer for later ones. Unsupported steps return
    /// [`FlowError::UnknownStep`].
    async fn step(
        &mut self,
        flow: &FlowCx,
        step_id: &str,
        input: Option<serde_json::Value>,
    ) -> Result<FlowOutcome, FlowError>;
}

pub(crate) struct FlowRecord {
    pub(crate) flow_id: String,
    pub(crate) handler: String,
    /// Integration domain (equals `handler` for config flows)
    pub(crate) domain: String,
    pub(crate) context: Arc<Mutex<FlowContext>>,
    pub(crate) init_step: String,
    pub(crate) version: u32,
    pub(crate) minor_version: u32,
    cur_step: Mutex<Option<String>>,
    flow: tokio::sync::Mutex<Box<dyn FlowHandler>>,
}

impl FlowRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow_id: String,
        handler: String,
        domain: String,
        context: FlowContext,
        init_step: String,
        version: u32,
        minor_version: u32,
        flow: Box<dyn FlowHandler>,
    ) -> Self {
        Self {
            flow_id,
            handler,
            domain,
            context: Arc::new(Mutex::new(context)),
            init_step,
            version,
            minor_version,
            cur_step: Mutex::new(None),
            flow: tokio::sync::Mutex::new(flow),
        }
    }

    pub(crate) fn context(&self) -> FlowContext {
        lock(&self.context).clone()
    }

    pub(crate) fn cur_step(&self) -> Option<String> {
        lock(&self.cur_step).clone()
    }

    pub(crate) fn set_cur_step(&self, step_id: Option<String>) {
        *lock(&self.cur_step) = step_id;
    }

    fn progress(&self) -> FlowProgress {
        FlowProgress {
            flow_id: self.flow_id.clone(),
            handler: self.handler.clone(),
            context: self.context(),
            step_id: self.cur_step(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Flows in progress, keyed by flow id
#[derive(Default)]
pub(crate) struct FlowCore {
    progress: DashMap<String, Arc<FlowRecord>>,
}

impl FlowCore {
    pub(crate) fn add(&self, record: Arc<FlowRecord>) {
        self.progress.insert(record.flow_id.clone(), record);
    }

    pub(crate) fn remove(&self, flow_id: &str) -> Option<Arc<FlowRecord>> {
        self.progress.remove(flow_id).map(|(_, record)| record)
    }

    pub(crate) fn get(&self, flow_id: &str) -> Option<Arc<FlowRecord>> {
        self.progress.get(flow_id).map(|r| r.value().clone())
    }

    pub(crate) fn contains(&self, flow_id: &str) -> bool {
        self.progress.contains_key(flow_id)
    }

    pub(crate) fn records(&self) -> Vec<Arc<FlowRecord>> {
        self.progress.iter().map(|r| r.value().clone()).collect()
    }

    pub(crate) fn progress(&self, include_uninitialized: bool) -> Vec<FlowProgress> {
        self.records()
            .iter()
            .map(|record| record.progress())
            .filter(|progress| include_uninitialized || progress.step_id.is_some())
            .collect()
    }

    pub(crate) fn progress_by_handler(
        &self,
        handler: &str,
        match_context: Option<&FlowContextMatch>,
        include_uninitialized: bool,
    ) -> Vec<FlowProgress> {
        self.records()
            .iter()
            .filter(|record| record.handler == handler)
            .map(|record| record.progress())
            .filter(|progress| include_uninitialized || progress.step_id.is_some())
            .filter(|progress| match_context.map_or(true, |m| m.matches(&progress.context)))
            .collect()
    }

    /// Run one step of `record`'s handler.
    ///
    /// Aborts raised through [`FlowError::Abort`] become abort results. The
    /// caller decides what a terminal result means and removes the flow.
    pub(crate) async fn run_step(
        &self,
        hub: &Arc<ConfigEntries>,
        record: &Arc<FlowRecord>,
        step_id: &str,
        input: Option<serde_json::Value>,
    ) -> ConfigEntriesResult<FlowResult> {
        let cx = FlowCx {
            flow_id: record.flow_id.clone(),
            handler: record.handler.clone(),
            domain: record.domain.clone(),
            context: record.context.clone(),
            hub: hub.clone(),
        };

        debug!(flow_id = %record.flow_id, handler = %record.handler, step_id, "Running flow step");
        let outcome = {
            let mut flow = record.flow.lock().await;
            AssertUnwindSafe(flow.step(&cx, step_id, input))
                .catch_unwind()
                .await
        };

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(FlowError::Abort { reason })) => FlowOutcome::abort(reason),
            Ok(Err(FlowError::UnknownStep(step_id))) => {
                return Err(ConfigEntriesError::UnknownStep {
                    handler: record.handler.clone(),
                    step_id,
                })
            }
            Ok(Err(FlowError::Other(message))) => {
                error!(flow_id = %record.flow_id, handler = %record.handler, "Flow step failed: {}", message);
                return Err(ConfigEntriesError::FlowFailed {
                    flow_id: record.flow_id.clone(),
                    message,
                });
            }
            Err(_) => {
                error!(flow_id = %record.flow_id, handler = %record.handler, step_id, "Flow step panicked");
                return Err(ConfigEntriesError::FlowFailed {
                    flow_id: record.flow_id.clone(),
                    message: format!("step {step_id} panicked"),
                });
            }
        };

        // Aborted from outside while the step ran
        if !self.contains(&record.flow_id) {
            return Err(ConfigEntriesError::UnknownFlow(record.flow_id.clone()));
        }

        Ok(FlowResult::from_outcome(record, outcome))
    }
}

/// Handle given to a flow step: its identity, context and the hub
#[derive(Clone)]
pub struct FlowCx {
    flow_id: String,
    handler: String,
    domain: String,
    context: Arc<Mutex<FlowContext>>,
    hub: Arc<ConfigEntries>,
}

impl std::fmt::Debug for FlowCx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowCx")
            .field("flow_id", &self.flow_id)
            .field("handler", &self.handler)
            .finish()
    }
}

impl FlowCx {
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn context(&self) -> FlowContext {
        lock(&self.context).clone()
    }

    pub fn source(&self) -> ConfigEntrySource {
        lock(&self.context).source
    }

    pub fn unique_id(&self) -> Option<String> {
        lock(&self.context).unique_id.clone()
    }

    pub fn config_entries(&self) -> &Arc<ConfigEntries> {
        &self.hub
    }

    /// The entry named by the flow context (reauth, reconfigure, options)
    pub fn config_entry(&self) -> Option<ConfigEntry> {
        let entry_id = lock(&self.context).entry_id.clone()?;
        self.hub.get_entry(&entry_id)
    }

    /// Mark the flow as only needing user confirmation
    pub fn set_confirm_only(&self) {
        lock(&self.context).confirm_only = true;
    }

    pub fn set_title_placeholder(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.context)
            .title_placeholders
            .insert(name.into(), value.into());
    }

    /// Set the flow's unique id and return any entry that already has it.
    ///
    /// With `raise_on_progress`, aborts with `already_in_progress` if another
    /// flow of this handler uses the same id. Flows waiting on the default
    /// discovery id are aborted once a real id is known.
    pub fn set_unique_id(
        &self,
        unique_id: Option<&str>,
        raise_on_progress: bool,
    ) -> Result<Option<ConfigEntry>, FlowError> {
        let Some(unique_id) = unique_id else {
            lock(&self.context).unique_id = None;
            return Ok(None);
        };

        if raise_on_progress
            && !self
                .in_progress(true, Some(&FlowContextMatch::unique_id(unique_id)))
                .is_empty()
        {
            return Err(FlowError::abort("already_in_progress"));
        }

        lock(&self.context).unique_id = Some(unique_id.to_string());

        if unique_id != DEFAULT_DISCOVERY_UNIQUE_ID {
            let placeholder = FlowContextMatch::unique_id(DEFAULT_DISCOVERY_UNIQUE_ID);
            for progress in self.in_progress(true, Some(&placeholder)) {
                let _ = self.hub.flow().abort(&progress.flow_id);
            }
        }

        Ok(self.hub.entry_for_domain_unique_id(&self.handler, unique_id))
    }

    /// Abort with `already_configured` if an entry has this flow's unique id.
    ///
    /// `updates` are merged into the existing entry's data first; the entry
    /// is reloaded when that changed something and it is loaded or retrying.
    /// A discovery that finds an entry stuck in setup retry reloads it too.
    pub fn abort_if_unique_id_configured(
        &self,
        updates: Option<EntryData>,
        reload_on_update: bool,
    ) -> Result<(), FlowError> {
        let Some(unique_id) = self.unique_id() else {
            return Ok(());
        };
        let Some(entry) = self.hub.entry_for_domain_unique_id(&self.handler, &unique_id) else {
            return Ok(());
        };
        let source = self.source();

        let mut should_reload = false;
        let updated = match updates {
            Some(updates) => {
                let mut data = entry.data().clone();
                data.extend(updates);
                self.hub
                    .update_entry(entry.entry_id(), ConfigEntryUpdate::new().data(data))
                    .unwrap_or(false)
            }
            None => false,
        };
        if updated
            && reload_on_update
            && matches!(
                entry.state(),
                ConfigEntryState::Loaded | ConfigEntryState::SetupRetry
            )
        {
            should_reload = true;
        } else if source.is_discovery() && entry.state() == ConfigEntryState::SetupRetry {
            should_reload = true;
        }

        // Ignored entries may still be configured by hand
        if entry.is_ignored() && source == ConfigEntrySource::User {
            return Ok(());
        }
        if should_reload {
            self.hub.schedule_reload(entry.entry_id());
        }
        Err(FlowError::abort("already_configured"))
    }

    /// Abort with `already_configured` if a non-ignored entry's data contains
    /// every pair in `match_data`
    pub fn abort_entries_match(&self, match_data: &EntryData) -> Result<(), FlowError> {
        let matched = self.current_entries(Some(false)).iter().any(|entry| {
            match_data
                .iter()
                .all(|(key, value)| entry.data().get(key) == Some(value))
        });
        if matched {
            return Err(FlowError::abort("already_configured"));
        }
        Ok(())
    }

    /// Entries of this handler. Ignored entries are hidden from user flows
    /// unless `include_ignore` says otherwise.
    pub fn current_entries(&self, include_ignore: Option<bool>) -> Vec<ConfigEntry> {
        let include_ignore =
            include_ignore.unwrap_or(self.source() != ConfigEntrySource::User);
        self.hub.entries(Some(&self.handler), include_ignore, true)
    }

    pub fn current_ids(&self, include_ignore: bool) -> HashSet<Option<String>> {
        self.hub
            .entries(Some(&self.handler), true, true)
            .into_iter()
            .filter(|entry| include_ignore || !entry.is_ignored())
            .map(|entry| entry.unique_id)
            .collect()
    }

    /// Other flows of this handler in progress
    pub fn in_progress(
        &self,
        include_uninitialized: bool,
        match_context: Option<&FlowContextMatch>,
    ) -> Vec<FlowProgress> {
        self.hub
            .flow()
            .progress_by_handler(&self.handler, match_context, include_uninitialized)
            .into_iter()
            .filter(|progress| progress.flow_id != self.flow_id)
            .collect()
    }

    /// For discoveries without an identifier: allow one flow per handler, and
    /// only while the handler has no entries
    pub fn handle_discovery_without_unique_id(&self) -> Result<(), FlowError> {
        if self.unique_id().is_some() {
            return Ok(());
        }
        if !self.current_entries(None).is_empty() {
            return Err(FlowError::abort("already_configured"));
        }

        self.set_unique_id(Some(DEFAULT_DISCOVERY_UNIQUE_ID), true)?;
        self.abort_if_unique_id_configured(None, true)?;

        if !self.in_progress(true, None).is_empty() {
            return Err(FlowError::abort("already_in_progress"));
        }
        Ok(())
    }

    /// Apply `update` to an entry, reload it if anything changed, and abort
    /// the flow with `reason`
    pub fn update_reload_and_abort(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
        reason: &str,
    ) -> FlowOutcome {
        if self.hub.update_entry(entry_id, update).unwrap_or(false) {
            self.hub.schedule_reload(entry_id);
        }
        FlowOutcome::abort(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_match() {
        let context = FlowContext::new(ConfigEntrySource::Reauth)
            .with_entry_id("e1")
            .with_unique_id("u1");

        assert!(FlowContextMatch::default().matches(&context));
        assert!(FlowContextMatch::source(ConfigEntrySource::Reauth).matches(&context));
        assert!(FlowContextMatch::entry_id("e1").matches(&context));
        assert!(FlowContextMatch::unique_id("u1").matches(&context));
        assert!(!FlowContextMatch::unique_id("u2").matches(&context));
        assert!(!FlowContextMatch::source(ConfigEntrySource::User).matches(&context));
    }

    #[test]
    fn test_outcome_builders() {
        let form = FlowOutcome::form("user").with_error("base", "cannot_connect");
        let FlowOutcome::Form { step_id, errors, .. } = form else {
            panic!("expected form");
        };
        assert_eq!(step_id, "user");
        assert_eq!(errors["base"], "cannot_connect");

        let mut options = EntryData::new();
        options.insert("scan".to_string(), serde_json::json!(30));
        let create = FlowOutcome::create_entry("Bridge", EntryData::new()).with_options(options);
        assert!(matches!(create, FlowOutcome::CreateEntry { options, .. } if options.len() == 1));
    }

    #[test]
    fn test_result_serialization() {
        let result = FlowResult::abort("f1", "hue", "already_configured");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "abort");
        assert_eq!(json["reason"], "already_configured");
        assert!(json.get("step_id").is_none());
    }
}
