//! File events and their processing results.
//!
//! A `FileEvent` is created once per detected change. Its identity never
//! changes; the pipeline only appends `ProcessingResult`s and advances its
//! `status`. Events are never deleted, a newer event for the same path simply
//! supersedes the old one in the event store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::FileMetadata;

/// What happened to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventType {
  Added,
  Changed,
  Deleted,
}

impl fmt::Display for FileEventType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FileEventType::Added => "added",
      FileEventType::Changed => "changed",
      FileEventType::Deleted => "deleted",
    };
    f.write_str(s)
  }
}

/// Which change source produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
  Watcher,
  Scanner,
}

/// Pipeline state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
  /// Detected and queued, not yet picked up by the processing loop
  #[default]
  Pending,
  /// Currently running through the processor chain
  Processing,
  /// Every processor that handled the event succeeded
  Completed,
  /// At least one processor failed
  Failed,
  /// No enabled processor accepted the event
  Skipped,
}

impl EventStatus {
  /// Returns true once the processing loop is done with the event
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Skipped)
  }
}

/// A single detected file change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
  pub id: Uuid,
  /// Groups events that belong to the same detection pass (one scan, or one
  /// watcher flush)
  pub correlation_id: Uuid,
  pub location_name: String,
  /// Path relative to the location root, `/`-separated
  pub file_path: String,
  pub event_type: FileEventType,
  pub detection_time: DateTime<Utc>,
  pub modification_time: Option<DateTime<Utc>>,
  pub checksum: Option<String>,
  pub file_size: u64,
  pub status: EventStatus,
  pub source: EventSource,
  pub processing_results: Vec<ProcessingResult>,
}

impl FileEvent {
  pub fn new(
    location_name: impl Into<String>,
    file_path: impl Into<String>,
    event_type: FileEventType,
    source: EventSource,
  ) -> Self {
    Self {
      id: Uuid::now_v7(),
      correlation_id: Uuid::nil(),
      location_name: location_name.into(),
      file_path: file_path.into(),
      event_type,
      detection_time: Utc::now(),
      modification_time: None,
      checksum: None,
      file_size: 0,
      status: EventStatus::Pending,
      source,
      processing_results: Vec::new(),
    }
  }

  pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
    self.correlation_id = correlation_id;
    self
  }

  /// Copy size and modification time from provider metadata
  pub fn with_metadata(mut self, metadata: &FileMetadata) -> Self {
    self.file_size = metadata.length;
    self.modification_time = metadata.last_modified;
    self
  }

  pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
    self.checksum = checksum;
    self
  }

  /// Append the results of one pass through the processor chain and settle
  /// the final status.
  pub fn complete(&mut self, results: Vec<ProcessingResult>) {
    self.status = if results.is_empty() {
      EventStatus::Skipped
    } else if results.iter().any(|r| !r.success) {
      EventStatus::Failed
    } else {
      EventStatus::Completed
    };
    self.processing_results.extend(results);
  }
}

/// Outcome of one processor's attempt at one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
  pub id: Uuid,
  pub file_event_id: Uuid,
  pub processor_name: String,
  pub success: bool,
  pub message: String,
  pub processed_at: DateTime<Utc>,
}

impl ProcessingResult {
  pub fn new(file_event_id: Uuid, processor_name: impl Into<String>, success: bool, message: impl Into<String>) -> Self {
    Self {
      id: Uuid::now_v7(),
      file_event_id,
      processor_name: processor_name.into(),
      success,
      message: message.into(),
      processed_at: Utc::now(),
    }
  }
}
