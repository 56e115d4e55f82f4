//! LocationHandler - one monitored location and its pipeline
//!
//! A location owns its event queue, rate limiter and processor chain, plus
//! handles to the storage provider and event store it was built with. It is
//! the unit of independent lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Running <-> Paused -> Stopping -> Stopped
//! ```
//!
//! # Tasks
//!
//! While running, a location has exactly one processing loop task (so its
//! events are handled strictly one at a time, in queue order) and, when the
//! provider supports it and the location is not on-demand-only, one watcher
//! task. Scans run on the caller's task and may overlap with both.
//!
//! # Shutdown
//!
//! `stop` cancels the location's child token, waits for the loop, the watcher
//! and any in-progress scan to finish, and only then closes the queue. Events
//! still queued stay there and are processed after the next `start`.

mod processing;
mod scanner;
mod watcher;

use std::{
  collections::HashMap,
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
  sync::{Notify, RwLock, watch},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  detect::ChangeDetector,
  domain::{
    config::{ConfigError, LocationOptions},
    event::FileEvent,
    pattern::PathFilter,
    scan::{ScanContext, ScanOptions, ScanSummary},
  },
  events::{EventPublisher, MonitorEvent},
  observer::ScanObserver,
  processor::{ProcessorChain, behavior::Behavior},
  queue::EventQueue,
  rate_limit::RateLimiter,
  storage::{StorageError, StorageProvider},
  store::{EventStore, StoreError},
};

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationStatus {
  Stopped,
  Starting,
  Running,
  Paused,
  Stopping,
}

impl std::fmt::Display for LocationStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      LocationStatus::Stopped => "stopped",
      LocationStatus::Starting => "starting",
      LocationStatus::Running => "running",
      LocationStatus::Paused => "paused",
      LocationStatus::Stopping => "stopping",
    };
    f.write_str(s)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("Location {0} is already running")]
  AlreadyRunning(String),
  #[error("Location {0} is not running")]
  NotRunning(String),
  #[error("Storage for location {0} failed its health check")]
  Unhealthy(String),
}

/// Counters kept per location since construction
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationStats {
  /// Events queued by the watcher or scanner
  pub detected: u64,
  /// Events that went through the processor chain
  pub processed: u64,
  /// Processed events that ended `Failed`
  pub failed: u64,
  pub last_scan: Option<ScanSummary>,
  pub last_error: Option<String>,
}

/// Point-in-time view of a location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationStatusReport {
  pub name: String,
  pub status: LocationStatus,
  pub paused: bool,
  pub watching: bool,
  pub queue_size: usize,
  pub in_flight: bool,
  pub stats: LocationStats,
}

/// Collaborators a location is built with
pub struct LocationDeps {
  pub provider: Arc<dyn StorageProvider>,
  pub store: Arc<dyn EventStore>,
  /// Processors available to the chain; options pick and order them by name
  pub processors: Vec<Arc<dyn crate::processor::Processor>>,
  /// Behaviours referenced by name from `BehaviorOptions::Custom`
  pub behaviors: HashMap<String, Arc<dyn Behavior>>,
  pub observers: Vec<Arc<dyn ScanObserver>>,
  pub publisher: EventPublisher,
}

impl LocationDeps {
  pub fn new(provider: Arc<dyn StorageProvider>, store: Arc<dyn EventStore>) -> Self {
    Self {
      provider,
      store,
      processors: Vec::new(),
      behaviors: HashMap::new(),
      observers: Vec::new(),
      publisher: EventPublisher::default(),
    }
  }

  pub fn with_processor(mut self, processor: Arc<dyn crate::processor::Processor>) -> Self {
    self.processors.push(processor);
    self
  }

  pub fn with_behavior(mut self, name: impl Into<String>, behavior: Arc<dyn Behavior>) -> Self {
    self.behaviors.insert(name.into(), behavior);
    self
  }

  pub fn with_observer(mut self, observer: Arc<dyn ScanObserver>) -> Self {
    self.observers.push(observer);
    self
  }

  pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
    self.publisher = publisher;
    self
  }
}

/// Failure while turning a listed path or notification into an event
#[derive(Debug, thiserror::Error)]
pub(crate) enum DetectionError {
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared between the handler and its tasks
pub(crate) struct LocationInner {
  options: LocationOptions,
  filter: PathFilter,
  detector: ChangeDetector,
  provider: Arc<dyn StorageProvider>,
  store: Arc<dyn EventStore>,
  chain: ProcessorChain,
  observers: Vec<Arc<dyn ScanObserver>>,
  publisher: EventPublisher,
  queue: EventQueue,
  /// Serialises producers between announcing an event and queueing it
  intake: Mutex<()>,
  limiter: RateLimiter,
  status: watch::Sender<LocationStatus>,
  paused: AtomicBool,
  resume: Notify,
  /// Held by the loop from the pause check until an event is fully processed
  dispatch: tokio::sync::Mutex<()>,
  in_flight: AtomicBool,
  watching: AtomicBool,
  /// Scans hold a read guard; `stop` takes the write guard before closing the queue
  scans: RwLock<()>,
  stats: Mutex<LocationStats>,
}

impl LocationInner {
  fn name(&self) -> &str {
    &self.options.name
  }

  fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  fn stats(&self) -> MutexGuard<'_, LocationStats> {
    self.stats.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_status(&self, current: LocationStatus) {
    let previous = self.status.send_replace(current);
    if previous != current {
      info!(location = %self.name(), from = %previous, to = %current, "Location status changed");
      self.publisher.publish(MonitorEvent::LocationStatusChanged {
        location: self.name().to_string(),
        previous,
        current,
      });
    }
  }

  /// Record and publish a recovered detection failure
  fn detection_error(&self, path: Option<&str>, message: String) {
    warn!(location = %self.name(), path = ?path, error = %message, "Detection error");
    self.stats().last_error = Some(message.clone());
    self.publisher.publish(MonitorEvent::DetectionError {
      location: self.name().to_string(),
      path: path.map(String::from),
      message,
    });
  }

  /// Persist a freshly detected event as pending, announce it and queue it
  async fn emit(&self, event: FileEvent) {
    if let Err(e) = self.store.store_event(&event).await {
      self.detection_error(Some(&event.file_path), format!("Failed to store event: {e}"));
    }

    self.stats().detected += 1;
    debug!(
      location = %self.name(),
      path = %event.file_path,
      event_type = %event.event_type,
      source = ?event.source,
      "Event detected"
    );

    // Announce and queue as one step: `FileEventReceived` order is queue order
    let _intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
    self.publisher.publish(MonitorEvent::FileEventReceived { event: event.clone() });
    if let Err(event) = self.queue.enqueue(event) {
      warn!(location = %self.name(), path = %event.file_path, "Queue closed, event not queued");
    }
  }
}

// ============================================================================
// LocationHandler
// ============================================================================

struct Runtime {
  cancel: CancellationToken,
  loop_handle: JoinHandle<()>,
  watcher_handle: Option<JoinHandle<()>>,
}

pub struct LocationHandler {
  inner: Arc<LocationInner>,
  runtime: tokio::sync::Mutex<Option<Runtime>>,
  /// Parent of every run's cancellation token
  parent: CancellationToken,
}

impl LocationHandler {
  /// Build a location. Invalid options or processor setup fail here.
  pub fn new(options: LocationOptions, deps: LocationDeps) -> Result<Self, LocationError> {
    Self::with_parent(options, deps, CancellationToken::new())
  }

  /// Build a location whose runs are children of `parent`
  pub fn with_parent(
    options: LocationOptions,
    deps: LocationDeps,
    parent: CancellationToken,
  ) -> Result<Self, LocationError> {
    options.validate()?;

    let chain = ProcessorChain::from_options(&options.name, &options.processors, &deps.processors, &deps.behaviors)?;
    let filter = options.path_filter()?;
    let (status, _) = watch::channel(LocationStatus::Stopped);

    let inner = LocationInner {
      filter,
      detector: ChangeDetector::from(options.change_detection),
      provider: deps.provider,
      store: deps.store,
      chain,
      observers: deps.observers,
      publisher: deps.publisher,
      queue: EventQueue::new(),
      intake: Mutex::new(()),
      limiter: RateLimiter::new(options.rate_limit),
      status,
      paused: AtomicBool::new(false),
      resume: Notify::new(),
      dispatch: tokio::sync::Mutex::new(()),
      in_flight: AtomicBool::new(false),
      watching: AtomicBool::new(false),
      scans: RwLock::new(()),
      stats: Mutex::new(LocationStats::default()),
      options,
    };

    debug!(
      location = %inner.name(),
      provider = inner.provider.name(),
      processors = ?inner.chain.names(),
      "Location created"
    );

    Ok(Self {
      inner: Arc::new(inner),
      runtime: tokio::sync::Mutex::new(None),
      parent,
    })
  }

  pub fn name(&self) -> &str {
    self.inner.name()
  }

  pub fn options(&self) -> &LocationOptions {
    &self.inner.options
  }

  pub fn status(&self) -> LocationStatus {
    *self.inner.status.borrow()
  }

  /// Follow status transitions
  pub fn subscribe_status(&self) -> watch::Receiver<LocationStatus> {
    self.inner.status.subscribe()
  }

  /// Running or paused
  pub fn is_active(&self) -> bool {
    matches!(self.status(), LocationStatus::Running | LocationStatus::Paused)
  }

  pub fn is_paused(&self) -> bool {
    self.inner.is_paused()
  }

  pub fn is_watching(&self) -> bool {
    self.inner.watching.load(Ordering::SeqCst)
  }

  pub fn publisher(&self) -> &EventPublisher {
    &self.inner.publisher
  }

  // --------------------------------------------------------------------------
  // Lifecycle
  // --------------------------------------------------------------------------

  /// Start watching and processing; runs the initial scan unless the
  /// location is on-demand-only or `scan_on_start` is off.
  pub async fn start(&self) -> Result<(), LocationError> {
    let scan = !self.inner.options.on_demand_only && self.inner.options.scan_on_start;
    self.start_with(scan).await
  }

  async fn start_with(&self, initial_scan: bool) -> Result<(), LocationError> {
    let cancel = {
      let mut runtime = self.runtime.lock().await;
      if runtime.is_some() {
        return Err(LocationError::AlreadyRunning(self.name().to_string()));
      }

      let inner = &self.inner;
      inner.set_status(LocationStatus::Starting);

      if !inner.provider.check_health().await {
        inner.set_status(LocationStatus::Stopped);
        return Err(LocationError::Unhealthy(self.name().to_string()));
      }

      inner.paused.store(false, Ordering::SeqCst);
      inner.queue.reopen();
      let cancel = self.parent.child_token();

      let watcher_handle = if inner.provider.supports_real_time_watching() && !inner.options.on_demand_only {
        match inner.provider.watch(inner.options.recursive) {
          Ok(subscription) => {
            inner.watching.store(true, Ordering::SeqCst);
            Some(watcher::WatcherTask::spawn(inner.clone(), subscription, cancel.clone()))
          }
          Err(e) => {
            // Scans still reconcile; carry on without live notifications
            inner.detection_error(None, format!("Failed to start watcher: {e}"));
            None
          }
        }
      } else {
        None
      };

      let loop_handle = tokio::spawn(processing::run(inner.clone(), cancel.clone()));

      *runtime = Some(Runtime {
        cancel: cancel.clone(),
        loop_handle,
        watcher_handle,
      });
      inner.set_status(LocationStatus::Running);
      cancel
    };

    info!(location = %self.name(), watching = self.is_watching(), "Location started");

    if initial_scan {
      let _gate = self.inner.scans.read().await;
      if !cancel.is_cancelled() {
        scanner::scan(&self.inner, ScanOptions::default(), &cancel).await;
      }
    }

    Ok(())
  }

  /// Stop the location. Stopping a stopped location is a no-op.
  pub async fn stop(&self) -> Result<(), LocationError> {
    let mut runtime = self.runtime.lock().await;
    let Some(rt) = runtime.take() else {
      return Ok(());
    };

    let inner = &self.inner;
    inner.set_status(LocationStatus::Stopping);
    rt.cancel.cancel();
    inner.resume.notify_waiters();

    if let Some(handle) = rt.watcher_handle
      && let Err(e) = handle.await
    {
      warn!(location = %self.name(), error = %e, "Watcher task failed");
    }
    if let Err(e) = rt.loop_handle.await {
      warn!(location = %self.name(), error = %e, "Processing loop failed");
    }

    // Wait out scans that were mid-listing when the token fired
    let _scans = inner.scans.write().await;

    inner.watching.store(false, Ordering::SeqCst);
    inner.paused.store(false, Ordering::SeqCst);
    inner.queue.close();
    inner.set_status(LocationStatus::Stopped);

    info!(location = %self.name(), backlog = inner.queue.len(), "Location stopped");
    Ok(())
  }

  /// Stop then start again, optionally forcing a fresh scan
  pub async fn restart(&self, rescan: bool) -> Result<(), LocationError> {
    self.stop().await?;
    self.start_with(rescan).await
  }

  /// Stop taking events off the queue. Detection keeps queueing.
  ///
  /// Returns once any in-flight event has finished processing.
  /// Returns `NotRunning` if a `stop` overtook the pause.
  pub async fn pause(&self) -> Result<(), LocationError> {
    if !self.is_active() {
      return Err(LocationError::NotRunning(self.name().to_string()));
    }
    self.inner.paused.store(true, Ordering::SeqCst);
    // Wait for the loop to let go of its current event
    drop(self.inner.dispatch.lock().await);

    // A stop may have run while we waited; it holds this lock until Stopped
    let runtime = self.runtime.lock().await;
    if runtime.is_none() || !self.is_active() {
      self.inner.paused.store(false, Ordering::SeqCst);
      return Err(LocationError::NotRunning(self.name().to_string()));
    }
    self.inner.set_status(LocationStatus::Paused);
    Ok(())
  }

  pub async fn resume(&self) -> Result<(), LocationError> {
    let runtime = self.runtime.lock().await;
    if runtime.is_none() || !self.is_active() {
      return Err(LocationError::NotRunning(self.name().to_string()));
    }
    self.inner.paused.store(false, Ordering::SeqCst);
    self.inner.resume.notify_waiters();
    self.inner.set_status(LocationStatus::Running);
    Ok(())
  }

  // --------------------------------------------------------------------------
  // Scanning
  // --------------------------------------------------------------------------

  /// Compare storage against the event store and queue every difference.
  ///
  /// Cancellation (stop, or `options.cancel`) ends the scan early with a
  /// partial context rather than an error.
  pub async fn scan(&self, options: ScanOptions) -> Result<ScanContext, LocationError> {
    // Validate ad-hoc patterns before touching anything
    PathFilter::new(
      &self.inner.options.file_pattern,
      &options.include_patterns,
      &options.exclude_patterns,
    )?;

    let cancel = self
      .runtime
      .lock()
      .await
      .as_ref()
      .map(|rt| rt.cancel.clone())
      .ok_or_else(|| LocationError::NotRunning(self.name().to_string()))?;

    // Taken after releasing the runtime lock; `stop` holds that lock while
    // waiting for the write side
    let _gate = self.inner.scans.read().await;
    if cancel.is_cancelled() {
      return Err(LocationError::NotRunning(self.name().to_string()));
    }

    Ok(scanner::scan(&self.inner, options, &cancel).await)
  }

  // --------------------------------------------------------------------------
  // Queue inspection
  // --------------------------------------------------------------------------

  pub fn queue_size(&self) -> usize {
    self.inner.queue.len()
  }

  pub fn is_queue_empty(&self) -> bool {
    self.inner.queue.is_empty()
  }

  /// Whether an event is being processed right now
  pub fn in_flight(&self) -> bool {
    self.inner.in_flight.load(Ordering::SeqCst)
  }

  /// Nothing queued and nothing being processed
  pub fn is_idle(&self) -> bool {
    self.is_queue_empty() && !self.in_flight()
  }

  /// Poll until idle or `timeout` elapses. Returns whether idle was reached.
  pub async fn wait_for_queue_empty(&self, timeout: Duration) -> bool {
    let poll = self.inner.options.queue_poll_interval().min(Duration::from_millis(20));
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
      if self.is_idle() {
        return true;
      }
      if tokio::time::Instant::now() >= deadline {
        return false;
      }
      tokio::time::sleep(poll).await;
    }
  }

  // --------------------------------------------------------------------------
  // Processors & status
  // --------------------------------------------------------------------------

  /// Toggle a processor. Returns false if the chain has no such processor.
  pub fn set_processor_enabled(&self, processor: &str, enabled: bool) -> bool {
    let found = self.inner.chain.set_enabled(processor, enabled);
    if found {
      info!(location = %self.name(), processor, enabled, "Processor toggled");
    }
    found
  }

  pub fn is_processor_enabled(&self, processor: &str) -> Option<bool> {
    self.inner.chain.is_enabled(processor)
  }

  pub fn processor_names(&self) -> Vec<String> {
    self.inner.chain.names()
  }

  pub fn stats(&self) -> LocationStats {
    self.inner.stats().clone()
  }

  pub fn status_report(&self) -> LocationStatusReport {
    LocationStatusReport {
      name: self.name().to_string(),
      status: self.status(),
      paused: self.is_paused(),
      watching: self.is_watching(),
      queue_size: self.queue_size(),
      in_flight: self.in_flight(),
      stats: self.stats(),
    }
  }
}

impl Drop for LocationHandler {
  fn drop(&mut self) {
    if let Some(rt) = self.runtime.get_mut().as_ref() {
      rt.cancel.cancel();
    }
  }
}

impl std::fmt::Debug for LocationHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LocationHandler")
      .field("name", &self.name())
      .field("status", &self.status())
      .field("queue_size", &self.queue_size())
      .finish()
  }
}
