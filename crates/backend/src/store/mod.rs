//! Event store - durable record of detected events and their results
//!
//! The store answers two questions for the pipeline: "what did we last see at
//! this path?" (change detection) and "which paths do we believe exist?"
//! (deletion detection). Events are never removed; a newer event for the same
//! `(location, path)` supersedes the older one.

mod memory;

use std::collections::HashSet;

pub use memory::MemoryEventStore;
use uuid::Uuid;

use crate::domain::event::{FileEvent, ProcessingResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("Unknown event: {0}")]
  UnknownEvent(Uuid),
  #[error("Event store unavailable: {0}")]
  Unavailable(String),
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
  async fn get_event(&self, id: Uuid) -> Result<Option<FileEvent>, StoreError>;

  /// The most recent event recorded for a path in a location
  async fn get_latest_event(&self, location: &str, path: &str) -> Result<Option<FileEvent>, StoreError>;

  /// Events of one location in first-stored order. `page` is zero-based.
  async fn get_events_for_location(
    &self,
    location: &str,
    page: usize,
    page_size: usize,
  ) -> Result<Vec<FileEvent>, StoreError>;

  /// Insert or update an event (keyed by id)
  async fn store_event(&self, event: &FileEvent) -> Result<(), StoreError>;

  async fn store_processing_result(&self, result: &ProcessingResult) -> Result<(), StoreError>;

  async fn get_processing_results(&self, event_id: Uuid) -> Result<Vec<ProcessingResult>, StoreError>;

  /// Paths whose latest event is not a deletion
  async fn get_present_paths(&self, location: &str) -> Result<HashSet<String>, StoreError>;
}
