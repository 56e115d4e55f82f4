//! One-off scan of a single location

use std::time::Duration;

use anyhow::{Context, Result, bail};
use filepulse::{config::MonitorConfig, scan::ScanOptions};

use super::build_service;

const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ScanArgs {
  pub location: String,
  pub wait: bool,
  pub include: Vec<String>,
  pub exclude: Vec<String>,
  pub max_files: Option<usize>,
  pub skip_checksum: bool,
}

/// Scan one location and print the summary as JSON
pub async fn cmd_scan(mut config: MonitorConfig, args: ScanArgs) -> Result<()> {
  let Some(location) = config.locations.iter_mut().find(|l| l.name == args.location) else {
    bail!("Unknown location: {}", args.location);
  };
  // Only the explicit scan below; no watcher, no startup scan
  location.on_demand_only = true;
  location.scan_on_start = false;
  config.locations.retain(|l| l.name == args.location);

  let service = build_service(&config)?;
  service.start_location(&args.location).await.context("Failed to start location")?;

  let mut options = ScanOptions {
    include_patterns: args.include,
    exclude_patterns: args.exclude,
    max_files: args.max_files,
    skip_checksum: args.skip_checksum,
    ..Default::default()
  };
  if args.wait {
    options = options.wait_for_processing(WAIT_TIMEOUT);
  }

  let result = service.scan_location(&args.location, options).await;
  service.stop_location(&args.location).await.context("Failed to stop location")?;
  let ctx = result.context("Scan failed")?;

  println!("{}", serde_json::to_string_pretty(&ctx.summary())?);
  Ok(())
}
