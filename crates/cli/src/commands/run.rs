//! Long-running monitoring

use anyhow::{Context, Result};
use filepulse::{config::MonitorConfig, events::MonitorEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::build_service;

/// Start every configured location and log published events until Ctrl-C
pub async fn cmd_run(config: MonitorConfig) -> Result<()> {
  if config.locations.is_empty() {
    warn!("No locations configured; see `filepulse config init`");
    return Ok(());
  }

  let service = build_service(&config)?;
  let mut events = service.subscribe();

  service.start().await.context("Failed to start locations")?;
  info!(locations = ?service.location_names(), "Monitoring started");

  let shutdown = tokio::signal::ctrl_c();
  tokio::pin!(shutdown);

  loop {
    tokio::select! {
      biased;

      result = &mut shutdown => {
        if let Err(e) = result {
          error!(err = %e, "Failed to listen for Ctrl-C");
        }
        info!("Shutdown requested");
        break;
      }

      received = events.recv() => match received {
        Ok(event) => log_event(&event),
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
        Err(RecvError::Closed) => break,
      },
    }
  }

  service.stop().await.context("Failed to stop locations")?;
  for report in service.get_all_location_status() {
    info!(
      location = %report.name,
      processed = report.stats.processed,
      failed = report.stats.failed,
      "Location stopped"
    );
  }
  Ok(())
}

fn log_event(event: &MonitorEvent) {
  match event {
    MonitorEvent::LocationStatusChanged {
      location,
      previous,
      current,
    } => info!(location = %location, ?previous, ?current, "Location status changed"),
    MonitorEvent::ScanCompleted { summary } => info!(
      location = %summary.location_name,
      scan_id = %summary.scan_id,
      state = ?summary.state,
      processed = summary.processed_items,
      errors = summary.error_count,
      "Scan completed"
    ),
    MonitorEvent::ProcessingError {
      location,
      path,
      processor,
      message,
      ..
    } => warn!(location = %location, path = %path, processor = %processor, message = %message, "Processor failed"),
    MonitorEvent::DetectionError {
      location,
      path,
      message,
    } => warn!(location = %location, path = ?path, message = %message, "Detection failed"),
    other => debug!(location = %other.location(), event = ?other, "Monitor event"),
  }
}
