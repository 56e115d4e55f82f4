//! MonitoringService - the control surface over every monitored location
//!
//! The service owns the location handlers keyed by name and fans lifecycle
//! calls out to them. All locations publish into one shared `EventPublisher`,
//! so a single subscription sees the whole system.
//!
//! Locations are independent: one failing to start does not stop the others
//! from starting, and each keeps its own queue, limiter and loop.

use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  domain::{
    config::{ConfigError, LocationOptions, MonitorConfig},
    scan::{ScanContext, ScanOptions},
  },
  events::{EventPublisher, MonitorEvent},
  location::{LocationDeps, LocationError, LocationHandler, LocationStatus, LocationStatusReport},
  processor::{Processor, behavior::Behavior},
  storage::StorageProvider,
  store::EventStore,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  #[error("Unknown location: {0}")]
  UnknownLocation(String),
  #[error("Location {location} has no processor named {processor}")]
  UnknownProcessor { location: String, processor: String },
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Location(#[from] LocationError),
}

// ============================================================================
// MonitoringService
// ============================================================================

pub struct MonitoringService {
  /// Handlers keyed by location name
  locations: DashMap<String, Arc<LocationHandler>>,
  publisher: EventPublisher,
  /// Parent of every location's run token
  cancel: CancellationToken,
}

impl MonitoringService {
  pub fn new() -> Self {
    Self::with_publisher(EventPublisher::default())
  }

  pub fn with_publisher(publisher: EventPublisher) -> Self {
    Self {
      locations: DashMap::new(),
      publisher,
      cancel: CancellationToken::new(),
    }
  }

  /// Build one location per configured entry, each on the provider its
  /// `storage` options name. Every location gets every processor in
  /// `processors`; the options pick and order them.
  pub fn from_config(
    config: &MonitorConfig,
    store: Arc<dyn EventStore>,
    processors: Vec<Arc<dyn Processor>>,
    behaviors: HashMap<String, Arc<dyn Behavior>>,
  ) -> Result<Self, ServiceError> {
    config.validate()?;

    let service = Self::new();
    for options in &config.locations {
      let provider = <dyn StorageProvider>::from_options(&options.storage);
      let mut deps = LocationDeps::new(provider, store.clone());
      deps.processors = processors.clone();
      deps.behaviors = behaviors.clone();
      service.add_location(options.clone(), deps)?;
    }

    info!(locations = service.locations.len(), "Monitoring service configured");
    Ok(service)
  }

  // --------------------------------------------------------------------------
  // Location management
  // --------------------------------------------------------------------------

  /// Register a location. Its events go to this service's publisher, not
  /// to `deps.publisher`.
  pub fn add_location(&self, options: LocationOptions, deps: LocationDeps) -> Result<Arc<LocationHandler>, ServiceError> {
    let name = options.name.clone();
    if self.locations.contains_key(&name) {
      return Err(ConfigError::DuplicateLocation(name).into());
    }

    let deps = deps.with_publisher(self.publisher.clone());
    let handler = Arc::new(LocationHandler::with_parent(options, deps, self.cancel.child_token())?);

    match self.locations.entry(name.clone()) {
      dashmap::mapref::entry::Entry::Occupied(_) => Err(ConfigError::DuplicateLocation(name).into()),
      dashmap::mapref::entry::Entry::Vacant(vacant) => {
        vacant.insert(handler.clone());
        debug!(location = %name, "Location added");
        Ok(handler)
      }
    }
  }

  /// Stop and forget a location
  pub async fn remove_location(&self, name: &str) -> Result<(), ServiceError> {
    let (_, handler) = self
      .locations
      .remove(name)
      .ok_or_else(|| ServiceError::UnknownLocation(name.to_string()))?;
    handler.stop().await?;
    info!(location = %name, "Location removed");
    Ok(())
  }

  pub fn location(&self, name: &str) -> Option<Arc<LocationHandler>> {
    self.locations.get(name).map(|entry| entry.value().clone())
  }

  /// Location names, sorted
  pub fn location_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.locations.iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
  }

  fn handler(&self, name: &str) -> Result<Arc<LocationHandler>, ServiceError> {
    self.location(name).ok_or_else(|| ServiceError::UnknownLocation(name.to_string()))
  }

  /// Snapshot of every handler, in name order. Never hold DashMap refs
  /// across an await.
  fn handlers(&self) -> Vec<Arc<LocationHandler>> {
    let mut handlers: Vec<Arc<LocationHandler>> = self.locations.iter().map(|entry| entry.value().clone()).collect();
    handlers.sort_by(|a, b| a.name().cmp(b.name()));
    handlers
  }

  // --------------------------------------------------------------------------
  // Lifecycle
  // --------------------------------------------------------------------------

  /// Start every location that is not already active. All locations are
  /// attempted; the first failure is returned afterwards.
  pub async fn start(&self) -> Result<(), ServiceError> {
    let handlers: Vec<_> = self.handlers().into_iter().filter(|h| !h.is_active()).collect();
    info!(count = handlers.len(), "Starting locations");

    let results = futures::future::join_all(handlers.iter().map(|h| h.start())).await;

    let mut first_error = None;
    for (handler, result) in handlers.iter().zip(results) {
      if let Err(e) = result {
        warn!(location = %handler.name(), error = %e, "Location failed to start");
        first_error.get_or_insert(e);
      }
    }

    match first_error {
      Some(e) => Err(e.into()),
      None => Ok(()),
    }
  }

  /// Stop every location
  pub async fn stop(&self) -> Result<(), ServiceError> {
    let handlers = self.handlers();
    if handlers.is_empty() {
      return Ok(());
    }

    info!(count = handlers.len(), "Stopping locations");
    let results = futures::future::join_all(handlers.iter().map(|h| h.stop())).await;

    let mut first_error = None;
    for (handler, result) in handlers.iter().zip(results) {
      if let Err(e) = result {
        warn!(location = %handler.name(), error = %e, "Location failed to stop");
        first_error.get_or_insert(e);
      }
    }

    info!("All locations stopped");
    match first_error {
      Some(e) => Err(e.into()),
      None => Ok(()),
    }
  }

  pub async fn start_location(&self, name: &str) -> Result<(), ServiceError> {
    Ok(self.handler(name)?.start().await?)
  }

  pub async fn stop_location(&self, name: &str) -> Result<(), ServiceError> {
    Ok(self.handler(name)?.stop().await?)
  }

  pub async fn pause_location(&self, name: &str) -> Result<(), ServiceError> {
    Ok(self.handler(name)?.pause().await?)
  }

  pub async fn resume_location(&self, name: &str) -> Result<(), ServiceError> {
    Ok(self.handler(name)?.resume().await?)
  }

  /// Stop then start a location, with or without a fresh scan
  pub async fn restart_location(&self, name: &str, rescan: bool) -> Result<(), ServiceError> {
    Ok(self.handler(name)?.restart(rescan).await?)
  }

  pub async fn scan_location(&self, name: &str, options: ScanOptions) -> Result<ScanContext, ServiceError> {
    Ok(self.handler(name)?.scan(options).await?)
  }

  // --------------------------------------------------------------------------
  // Status
  // --------------------------------------------------------------------------

  pub fn is_location_active(&self, name: &str) -> Result<bool, ServiceError> {
    Ok(self.handler(name)?.is_active())
  }

  pub fn get_location_status(&self, name: &str) -> Result<LocationStatus, ServiceError> {
    Ok(self.handler(name)?.status())
  }

  /// Reports for every location, in name order
  pub fn get_all_location_status(&self) -> Vec<LocationStatusReport> {
    self.handlers().iter().map(|h| h.status_report()).collect()
  }

  // --------------------------------------------------------------------------
  // Queues
  // --------------------------------------------------------------------------

  /// Events queued across all locations
  pub fn get_queue_size(&self) -> usize {
    self.locations.iter().map(|entry| entry.value().queue_size()).sum()
  }

  pub fn get_location_queue_size(&self, name: &str) -> Result<usize, ServiceError> {
    Ok(self.handler(name)?.queue_size())
  }

  pub fn is_queue_empty(&self) -> bool {
    self.locations.iter().all(|entry| entry.value().is_queue_empty())
  }

  /// Wait until every location is idle or `timeout` elapses. Returns whether
  /// everything drained in time.
  pub async fn wait_for_queue_empty(&self, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    for handler in self.handlers() {
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if !handler.wait_for_queue_empty(remaining).await {
        debug!(location = %handler.name(), queue_size = handler.queue_size(), "Queue did not drain in time");
        return false;
      }
    }
    true
  }

  // --------------------------------------------------------------------------
  // Processors
  // --------------------------------------------------------------------------

  /// Enable a processor on every location that has it. Returns how many
  /// locations have it.
  pub fn enable_processor(&self, processor: &str) -> usize {
    self.toggle_everywhere(processor, true)
  }

  pub fn disable_processor(&self, processor: &str) -> usize {
    self.toggle_everywhere(processor, false)
  }

  fn toggle_everywhere(&self, processor: &str, enabled: bool) -> usize {
    self
      .handlers()
      .iter()
      .filter(|h| h.set_processor_enabled(processor, enabled))
      .count()
  }

  pub fn set_processor_enabled(&self, location: &str, processor: &str, enabled: bool) -> Result<(), ServiceError> {
    if self.handler(location)?.set_processor_enabled(processor, enabled) {
      Ok(())
    } else {
      Err(ServiceError::UnknownProcessor {
        location: location.to_string(),
        processor: processor.to_string(),
      })
    }
  }

  // --------------------------------------------------------------------------
  // Events
  // --------------------------------------------------------------------------

  /// Follow every location's published events
  pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
    self.publisher.subscribe()
  }

  pub fn publisher(&self) -> &EventPublisher {
    &self.publisher
  }
}

impl Default for MonitoringService {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for MonitoringService {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
