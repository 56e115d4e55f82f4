use std::time::Duration;

use tracing::{debug, info, trace};

use crate::domain::{event::FileEvent, scan::ScanContext};

/// Hooks into the lifecycle of a scan. All methods default to no-ops.
#[async_trait::async_trait]
pub trait ScanObserver: Send + Sync {
  async fn on_scan_started(&self, _ctx: &ScanContext) {}

  async fn on_file_detected(&self, _ctx: &ScanContext, _event: &FileEvent) {}

  async fn on_scan_completed(&self, _ctx: &ScanContext, _duration: Duration) {}
}

/// Reports scan progress through tracing
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingScanObserver;

#[async_trait::async_trait]
impl ScanObserver for LoggingScanObserver {
  async fn on_scan_started(&self, ctx: &ScanContext) {
    debug!(location = %ctx.location_name, scan_id = %ctx.scan_id, "Scan started");
  }

  async fn on_file_detected(&self, ctx: &ScanContext, event: &FileEvent) {
    trace!(
      location = %ctx.location_name,
      path = %event.file_path,
      event_type = %event.event_type,
      "Change detected"
    );
  }

  async fn on_scan_completed(&self, ctx: &ScanContext, duration: Duration) {
    info!(
      location = %ctx.location_name,
      scan_id = %ctx.scan_id,
      processed = ctx.processed_items,
      added = ctx.detected_changes.added,
      changed = ctx.detected_changes.changed,
      deleted = ctx.detected_changes.deleted,
      errors = ctx.errors.len(),
      duration_ms = duration.as_millis(),
      "Scan completed"
    );
  }
}
