//! Options flows
//!
//! An options flow edits the options of one existing entry. Flows are keyed
//! by entry id and always start at the `init` step; finishing one replaces
//! the entry's options with the flow's data.

use std::sync::{Arc, Weak};
use tracing::debug;

use crate::entry::{ConfigEntrySource, ConfigEntryUpdate};
use crate::error::{ConfigEntriesError, ConfigEntriesResult};
use crate::flow::{FlowContext, FlowCore, FlowProgress, FlowRecord, FlowResult};
use crate::manager::ConfigEntries;

const INIT_STEP: &str = "init";

pub struct OptionsFlowManager {
    hub: Weak<ConfigEntries>,
    core: FlowCore,
}

impl std::fmt::Debug for OptionsFlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionsFlowManager").finish_non_exhaustive()
    }
}

impl OptionsFlowManager {
    pub(crate) fn new(hub: Weak<ConfigEntries>) -> Self {
        Self {
            hub,
            core: FlowCore::default(),
        }
    }

    fn hub(&self) -> ConfigEntriesResult<Arc<ConfigEntries>> {
        self.hub.upgrade().ok_or(ConfigEntriesError::ManagerGone)
    }

    /// Start an options flow for `entry_id`
    pub async fn init(
        &self,
        entry_id: &str,
        data: Option<serde_json::Value>,
    ) -> ConfigEntriesResult<FlowResult> {
        let hub = self.hub()?;
        let entry = hub
            .get_entry(entry_id)
            .ok_or_else(|| ConfigEntriesError::UnknownEntry(entry_id.to_string()))?;
        let registration = hub
            .flow()
            .registration(entry.domain())
            .ok_or_else(|| ConfigEntriesError::UnknownHandler(entry.domain().to_string()))?;
        let handler = registration.create_options_flow(&entry).ok_or_else(|| {
            ConfigEntriesError::OperationNotAllowed(format!(
                "{} does not support options",
                entry.domain()
            ))
        })?;

        let flow_id = uuid::Uuid::new_v4().simple().to_string();
        let mut context = FlowContext::new(ConfigEntrySource::User).with_entry_id(entry_id);
        context.unique_id = entry.unique_id.clone();
        let record = Arc::new(FlowRecord::new(
            flow_id.clone(),
            entry_id.to_string(),
            entry.domain().to_string(),
            context,
            INIT_STEP.to_string(),
            entry.version(),
            entry.minor_version(),
            handler,
        ));
        self.core.add(record.clone());

        match self.handle_step(&hub, &record, INIT_STEP, data).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.core.remove(&flow_id);
                Err(err)
            }
        }
    }

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

    pub fn abort(&self, flow_id: &str) -> ConfigEntriesResult<()> {
        self.core
            .remove(flow_id)
            .map(|_| ())
            .ok_or_else(|| ConfigEntriesError::UnknownFlow(flow_id.to_string()))
    }

    pub fn progress(&self) -> Vec<FlowProgress> {
        self.core.progress(true)
    }

    /// Options flows open for `entry_id`
    pub fn progress_for_entry(&self, entry_id: &str) -> Vec<FlowProgress> {
        self.core.progress_by_handler(entry_id, None, true)
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

        if result.is_create_entry() {
            let entry_id = &record.handler;
            if let Some(options) = result.data.clone() {
                hub.update_entry(entry_id, ConfigEntryUpdate::new().options(options))?;
            }
            debug!(entry_id = %entry_id, "Options flow finished");
        }
        self.core.remove(&record.flow_id);
        Ok(result)
    }
}
