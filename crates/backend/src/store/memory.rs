use std::collections::HashSet;

use dashmap::{DashMap, mapref::entry::Entry};
use uuid::Uuid;

use super::{EventStore, StoreError};
use crate::domain::event::{FileEvent, FileEventType, ProcessingResult};

/// Process-local event store
#[derive(Debug, Default)]
pub struct MemoryEventStore {
  events: DashMap<Uuid, FileEvent>,
  /// (location, path) -> id of the newest event
  latest: DashMap<(String, String), Uuid>,
  /// location -> event ids in first-stored order
  order: DashMap<String, Vec<Uuid>>,
  results: DashMap<Uuid, Vec<ProcessingResult>>,
}

impl MemoryEventStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn event_count(&self) -> usize {
    self.events.len()
  }

  /// Snapshot of every stored event of a location, oldest first
  pub fn events_for(&self, location: &str) -> Vec<FileEvent> {
    let ids = self.order.get(location).map(|ids| ids.clone()).unwrap_or_default();
    ids
      .iter()
      .filter_map(|id| self.events.get(id).map(|e| e.clone()))
      .collect()
  }

  /// Whether `incoming` should replace `current` as the latest event for its path
  fn supersedes(incoming: &FileEvent, current: &FileEvent) -> bool {
    (incoming.detection_time, incoming.id) >= (current.detection_time, current.id)
  }
}

#[async_trait::async_trait]
impl EventStore for MemoryEventStore {
  async fn get_event(&self, id: Uuid) -> Result<Option<FileEvent>, StoreError> {
    Ok(self.events.get(&id).map(|e| e.clone()))
  }

  async fn get_latest_event(&self, location: &str, path: &str) -> Result<Option<FileEvent>, StoreError> {
    let id = self
      .latest
      .get(&(location.to_string(), path.to_string()))
      .map(|id| *id);
    Ok(id.and_then(|id| self.events.get(&id).map(|e| e.clone())))
  }

  async fn get_events_for_location(
    &self,
    location: &str,
    page: usize,
    page_size: usize,
  ) -> Result<Vec<FileEvent>, StoreError> {
    let page_size = page_size.max(1);
    let ids: Vec<Uuid> = self
      .order
      .get(location)
      .map(|ids| ids.iter().skip(page.saturating_mul(page_size)).take(page_size).copied().collect())
      .unwrap_or_default();

    Ok(
      ids
        .iter()
        .filter_map(|id| self.events.get(id).map(|e| e.clone()))
        .collect(),
    )
  }

  async fn store_event(&self, event: &FileEvent) -> Result<(), StoreError> {
    let is_new = self.events.insert(event.id, event.clone()).is_none();
    if is_new {
      self.order.entry(event.location_name.clone()).or_default().push(event.id);
    }

    let key = (event.location_name.clone(), event.file_path.clone());
    match self.latest.entry(key) {
      Entry::Occupied(mut entry) => {
        let current = *entry.get();
        let replace = current == event.id
          || self
            .events
            .get(&current)
            .is_none_or(|current| Self::supersedes(event, &current));
        if replace {
          entry.insert(event.id);
        }
      }
      Entry::Vacant(entry) => {
        entry.insert(event.id);
      }
    }

    Ok(())
  }

  async fn store_processing_result(&self, result: &ProcessingResult) -> Result<(), StoreError> {
    if !self.events.contains_key(&result.file_event_id) {
      return Err(StoreError::UnknownEvent(result.file_event_id));
    }

    let mut results = self.results.entry(result.file_event_id).or_default();
    match results.iter_mut().find(|r| r.id == result.id) {
      Some(existing) => *existing = result.clone(),
      None => results.push(result.clone()),
    }
    Ok(())
  }

  async fn get_processing_results(&self, event_id: Uuid) -> Result<Vec<ProcessingResult>, StoreError> {
    Ok(self.results.get(&event_id).map(|r| r.clone()).unwrap_or_default())
  }

  async fn get_present_paths(&self, location: &str) -> Result<HashSet<String>, StoreError> {
    let candidates: Vec<(String, Uuid)> = self
      .latest
      .iter()
      .filter(|entry| entry.key().0 == location)
      .map(|entry| (entry.key().1.clone(), *entry.value()))
      .collect();

    Ok(
      candidates
        .into_iter()
        .filter(|(_, id)| {
          self
            .events
            .get(id)
            .is_some_and(|e| e.event_type != FileEventType::Deleted)
        })
        .map(|(path, _)| path)
        .collect(),
    )
  }
}
