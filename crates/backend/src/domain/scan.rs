//! Scan invocation state and options.
//!
//! A `ScanContext` lives for the duration of one scan call and is handed back
//! to the caller when the scan finishes (or is cancelled part-way).

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::event::{FileEvent, FileEventType};

/// Lifecycle of one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
  Starting,
  InProgress,
  Completing,
  Completed,
  Failed,
}

/// Running counters of detected changes, by type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedChanges {
  pub added: usize,
  pub changed: usize,
  pub deleted: usize,
}

impl DetectedChanges {
  pub fn record(&mut self, event_type: FileEventType) {
    match event_type {
      FileEventType::Added => self.added += 1,
      FileEventType::Changed => self.changed += 1,
      FileEventType::Deleted => self.deleted += 1,
    }
  }

  pub fn total(&self) -> usize {
    self.added + self.changed + self.deleted
  }
}

/// A detection error recorded during a scan. The scan carries on after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanErrorRecord {
  pub path: Option<String>,
  pub message: String,
  pub at: DateTime<Utc>,
}

/// State and telemetry of one scan invocation
#[derive(Debug, Clone)]
pub struct ScanContext {
  pub scan_id: Uuid,
  pub location_name: String,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  pub processed_items: usize,
  pub detected_changes: DetectedChanges,
  pub state: ScanState,
  pub errors: Vec<ScanErrorRecord>,
  /// Set when the listing stopped early (cancellation or `max_files`)
  pub cancelled: bool,
  /// Free-form values for observer extensions
  pub properties: serde_json::Map<String, serde_json::Value>,
  /// Events emitted by this scan, in emission order
  pub events: Vec<FileEvent>,
}

impl ScanContext {
  pub fn new(location_name: impl Into<String>) -> Self {
    Self {
      scan_id: Uuid::now_v7(),
      location_name: location_name.into(),
      start_time: Utc::now(),
      end_time: None,
      processed_items: 0,
      detected_changes: DetectedChanges::default(),
      state: ScanState::Starting,
      errors: Vec::new(),
      cancelled: false,
      properties: serde_json::Map::new(),
      events: Vec::new(),
    }
  }

  pub fn record_error(&mut self, path: Option<&str>, message: impl Into<String>) {
    self.errors.push(ScanErrorRecord {
      path: path.map(String::from),
      message: message.into(),
      at: Utc::now(),
    });
  }

  pub fn record_event(&mut self, event: FileEvent) {
    self.detected_changes.record(event.event_type);
    self.events.push(event);
  }

  pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
    self.properties.insert(key.into(), value.into());
  }

  /// Events of one type emitted by this scan
  pub fn events_of(&self, event_type: FileEventType) -> impl Iterator<Item = &FileEvent> {
    self.events.iter().filter(move |e| e.event_type == event_type)
  }

  pub fn duration(&self) -> Option<Duration> {
    self
      .end_time
      .and_then(|end| (end - self.start_time).to_std().ok())
  }

  pub fn summary(&self) -> ScanSummary {
    ScanSummary {
      scan_id: self.scan_id,
      location_name: self.location_name.clone(),
      state: self.state,
      start_time: self.start_time,
      end_time: self.end_time,
      processed_items: self.processed_items,
      detected_changes: self.detected_changes,
      error_count: self.errors.len(),
      cancelled: self.cancelled,
    }
  }
}

/// Serializable digest of a finished scan
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
  pub scan_id: Uuid,
  pub location_name: String,
  pub state: ScanState,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
  pub processed_items: usize,
  pub detected_changes: DetectedChanges,
  pub error_count: usize,
  pub cancelled: bool,
}

/// Progress report sent while a scan runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
  pub scan_id: Uuid,
  pub processed_items: usize,
  pub detected: usize,
  pub current_file: Option<String>,
}

/// Options for an on-demand scan
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
  /// Wait until the location has processed everything the scan queued
  pub wait_for_processing: bool,
  /// Bound on `wait_for_processing`
  pub timeout: Option<Duration>,
  /// Only emit these event types (`None` = all)
  pub event_types: Option<HashSet<FileEventType>>,
  /// Listing page size; overrides the location's `scan_page_size`
  pub batch_size: Option<usize>,
  pub include_patterns: Vec<String>,
  pub exclude_patterns: Vec<String>,
  /// Compare timestamps even on checksum locations
  pub skip_checksum: bool,
  /// Stop after this many listed files
  pub max_files: Option<usize>,
  pub progress: Option<mpsc::Sender<ScanProgress>>,
  /// Caller-side cancellation, on top of the location stopping
  pub cancel: Option<CancellationToken>,
}

impl ScanOptions {
  pub fn allows(&self, event_type: FileEventType) -> bool {
    self
      .event_types
      .as_ref()
      .is_none_or(|types| types.contains(&event_type))
  }

  pub fn wait_for_processing(mut self, timeout: Duration) -> Self {
    self.wait_for_processing = true;
    self.timeout = Some(timeout);
    self
  }

  pub fn only(mut self, types: impl IntoIterator<Item = FileEventType>) -> Self {
    self.event_types = Some(types.into_iter().collect());
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = Some(cancel);
    self
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
  }
}
