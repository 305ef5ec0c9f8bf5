//! Core types for Home Assistant
//!
//! This crate provides the fundamental types shared by the config entry
//! hub: Context, Event, EventType and the CoreState of the running instance.

mod context;
mod core_state;
mod event;

pub use context::Context;
pub use core_state::CoreState;
pub use event::{Event, EventData, EventOrigin, EventType};

/// Standard event types used by Home Assistant
pub mod events {
    use super::*;

    /// Fired once the instance has fully started
    pub const HOMEASSISTANT_STARTED: &str = "homeassistant_started";

    /// Fired when the instance begins shutting down
    pub const HOMEASSISTANT_STOP: &str = "homeassistant_stop";

    /// Fired (debounced) when discovery starts new config flows
    pub const CONFIG_ENTRY_DISCOVERED: &str = "config_entry_discovered";

    /// Data for CONFIG_ENTRY_DISCOVERED events
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    pub struct ConfigEntryDiscoveredData {}

    impl EventData for ConfigEntryDiscoveredData {
        fn event_type() -> &'static str {
            CONFIG_ENTRY_DISCOVERED
        }
    }

    /// Data for HOMEASSISTANT_STARTED / HOMEASSISTANT_STOP events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct CoreStateData {
        pub state: CoreState,
    }
}
