//! CLI command implementations

mod config;
mod run;
mod scan;

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use filepulse::{MonitoringService, config::MonitorConfig, store::MemoryEventStore};

use crate::processor::builtin_processors;

pub use config::{cmd_config_init, cmd_config_path, cmd_config_show};
pub use run::cmd_run;
pub use scan::{ScanArgs, cmd_scan};

/// Load the config from an explicit path, or fall back to the default lookup
pub fn load_config(explicit: Option<&Path>) -> Result<MonitorConfig> {
  match explicit {
    Some(path) => MonitorConfig::load(path).with_context(|| format!("Failed to load config {:?}", path)),
    None => MonitorConfig::load_default().context("Failed to load config"),
  }
}

/// Build the service with the CLI's processors and an in-memory event store
fn build_service(config: &MonitorConfig) -> Result<MonitoringService> {
  MonitoringService::from_config(
    config,
    Arc::new(MemoryEventStore::new()),
    builtin_processors(),
    HashMap::new(),
  )
  .context("Failed to build monitoring service")
}
