//! Change detection strategies.
//!
//! Given the metadata of a listed file and the last stored event for its path,
//! decide whether the file changed and, if so, what kind of event to emit.
//! A path with no prior event, or whose last event was a deletion, always
//! comes back as `Added`, never `Changed`.

use crate::domain::{
  config::ChangeDetection,
  event::{FileEvent, FileEventType},
  metadata::FileMetadata,
};

/// One strategy per location, chosen from `LocationOptions::change_detection`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDetector {
  Timestamp,
  Checksum,
}

impl From<ChangeDetection> for ChangeDetector {
  fn from(strategy: ChangeDetection) -> Self {
    match strategy {
      ChangeDetection::Timestamp => Self::Timestamp,
      ChangeDetection::Checksum => Self::Checksum,
    }
  }
}

impl ChangeDetector {
  /// Whether the scanner must fetch a checksum before calling `detect`
  pub fn requires_checksum(&self) -> bool {
    matches!(self, Self::Checksum)
  }

  /// Returns true if `current` differs from what `last` recorded.
  ///
  /// `checksum` is the provider checksum of the current content. The checksum
  /// strategy falls back to timestamps when it is missing (e.g. a scan run
  /// with checksums skipped).
  pub fn has_changed(&self, current: &FileMetadata, checksum: Option<&str>, last: Option<&FileEvent>) -> bool {
    let Some(last) = last else {
      return true;
    };

    if last.event_type == FileEventType::Deleted {
      return true;
    }

    match (self, checksum) {
      (Self::Checksum, Some(checksum)) => last.checksum.as_deref() != Some(checksum),
      _ => current.last_modified != last.modification_time,
    }
  }

  /// Classify a listed file against its last stored event
  pub fn detect(&self, current: &FileMetadata, checksum: Option<&str>, last: Option<&FileEvent>) -> Option<FileEventType> {
    if !self.has_changed(current, checksum, last) {
      return None;
    }

    match last {
      Some(last) if last.event_type != FileEventType::Deleted => Some(FileEventType::Changed),
      _ => Some(FileEventType::Added),
    }
  }
}
