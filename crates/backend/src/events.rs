//! Published monitoring events.
//!
//! Every location publishes into one `EventPublisher` shared through the
//! service. Consumers subscribe to a broadcast receiver; a slow consumer lags
//! and loses the oldest events rather than stalling the pipeline.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
  domain::{
    event::{FileEvent, FileEventType},
    scan::ScanSummary,
  },
  location::LocationStatus,
};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
  /// A watcher or scanner queued an event
  FileEventReceived { event: FileEvent },
  BeforeProcessing {
    location: String,
    event_id: Uuid,
    path: String,
    event_type: FileEventType,
  },
  /// The event went through the chain; carries its final status and results
  AfterProcessing { event: FileEvent },
  /// One processor failed on one event
  ProcessingError {
    location: String,
    event_id: Uuid,
    path: String,
    processor: String,
    message: String,
  },
  /// Storage or store failure while detecting changes
  DetectionError {
    location: String,
    path: Option<String>,
    message: String,
  },
  LocationStatusChanged {
    location: String,
    previous: LocationStatus,
    current: LocationStatus,
  },
  ScanStarted { location: String, scan_id: Uuid },
  ScanCompleted { summary: ScanSummary },
}

impl MonitorEvent {
  /// Name of the location the event belongs to
  pub fn location(&self) -> &str {
    match self {
      MonitorEvent::FileEventReceived { event } | MonitorEvent::AfterProcessing { event } => &event.location_name,
      MonitorEvent::BeforeProcessing { location, .. }
      | MonitorEvent::ProcessingError { location, .. }
      | MonitorEvent::DetectionError { location, .. }
      | MonitorEvent::LocationStatusChanged { location, .. }
      | MonitorEvent::ScanStarted { location, .. } => location,
      MonitorEvent::ScanCompleted { summary } => &summary.location_name,
    }
  }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
  sender: broadcast::Sender<MonitorEvent>,
}

impl EventPublisher {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  pub fn publish(&self, event: MonitorEvent) {
    // No subscribers is fine
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
    self.sender.subscribe()
  }

  pub fn subscriber_count(&self) -> usize {
    self.sender.receiver_count()
  }
}

impl Default for EventPublisher {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}
