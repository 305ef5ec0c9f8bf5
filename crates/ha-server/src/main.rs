//! Home Assistant Rust Server
//!
//! Loads the configuration, restores config entries from storage and sets
//! them up, then runs until interrupted.

use anyhow::{Context as _, Result};
use ha_config::{load_config, HubConfig};
use ha_config_entries::ConfigEntries;
use ha_core::CoreState;
use ha_event_bus::EventBus;
use ha_registries::Storage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable naming the configuration directory
const CONFIG_DIR_ENV: &str = "HASS_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "config";

/// The central Home Assistant instance
pub struct HomeAssistant {
    pub config: HubConfig,
    /// Event bus for pub/sub communication
    pub bus: Arc<EventBus>,
    /// Config entries and their flows
    pub config_entries: Arc<ConfigEntries>,
}

impl HomeAssistant {
    /// Create a new Home Assistant instance
    pub fn new(config: HubConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let config_entries = ConfigEntries::new(
            Storage::new(&config.config_dir),
            bus.clone(),
            config.config_entries.clone(),
        );

        Self {
            config,
            bus,
            config_entries,
        }
    }

    /// Restore stored entries and set them up
    pub async fn start(&self) -> Result<()> {
        self.config_entries
            .initialize()
            .await
            .context("loading config entries")?;
        self.config_entries.set_core_state(CoreState::Starting).await;

        let results = self.config_entries.setup_all().await;
        let loaded = results.iter().filter(|(_, loaded)| *loaded).count();
        info!("{} of {} config entries loaded", loaded, results.len());
        for (entry_id, _) in results.iter().filter(|(_, loaded)| !loaded) {
            if let Some(entry) = self.config_entries.get_entry(entry_id) {
                warn!(
                    domain = %entry.domain(),
                    entry_id = %entry_id,
                    state = %entry.state(),
                    "Config entry not loaded"
                );
            }
        }

        self.config_entries.set_core_state(CoreState::Running).await;
        Ok(())
    }

    /// Cancel retries and flows, then write pending changes
    pub async fn stop(&self) {
        self.config_entries.set_core_state(CoreState::Stopping).await;
        self.config_entries.block_till_done().await;
        self.config_entries.set_core_state(CoreState::Stopped).await;
    }
}

fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting Home Assistant (Rust)");

    let config_dir = config_dir();
    let config = load_config(&config_dir)
        .with_context(|| format!("loading configuration from {:?}", config_dir))?;
    let hass = HomeAssistant::new(config);

    hass.start().await?;
    info!("Home Assistant is running");

    // Keep the server running
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    hass.stop().await;

    Ok(())
}
