//! Config Entries
//!
//! This crate provides the configuration entry system for Home Assistant.
//! Config entries represent individual integration instances and manage
//! their lifecycle (setup, unload, reload, migration, removal), together
//! with the multi-step flows that create and edit them.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`Integration`] - Hooks an integration provides for its entries
//! - [`FlowHandler`] - One step-driven configuration flow
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/core.config_entries` with
//! version tracking for migrations. Writes are coalesced by a delayed save.

pub mod config_flow;
pub mod debounce;
pub mod entry;
pub mod error;
pub mod flow;
pub mod integration;
mod lifecycle;
pub mod manager;
pub mod options_flow;
pub mod persistence;
pub mod registry;
mod runtime;
pub mod state_machine;

// Re-export main types
pub use config_flow::{
    ConfigEntriesFlowManager, FlowHandlerRegistration, DISCOVERY_NOTIFICATION_ID, ISSUE_DOMAIN,
    RECONFIGURE_NOTIFICATION_ID,
};
pub use debounce::Debouncer;
pub use entry::{
    ConfigEntry, ConfigEntryChange, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState,
    ConfigEntryUpdate, EntryData,
};
pub use error::{ConfigEntriesError, ConfigEntriesResult, ConfigEntryError, FlowError};
pub use flow::{
    FlowContext, FlowContextMatch, FlowCx, FlowHandler, FlowOutcome, FlowProgress, FlowResult,
    FlowResultType, DEFAULT_DISCOVERY_UNIQUE_ID,
};
pub use integration::{EntryContext, Integration};
pub use manager::{ConfigEntries, RemoveResult};
pub use options_flow::OptionsFlowManager;
pub use persistence::{
    ConfigEntriesData, StoredConfigEntry, STORAGE_KEY, STORAGE_MINOR_VERSION, STORAGE_VERSION,
};
pub use registry::ConfigEntryItems;
pub use state_machine::{retry_delay, InvalidTransition};
