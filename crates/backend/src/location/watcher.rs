//! WatcherTask - turns provider notifications into queued events
//!
//! Notifications arrive on the subscription channel already relative to the
//! provider root. They are debounced per path, then each settled change is
//! reconciled with the path's last stored event and emitted with
//! `Source = Watcher`.
//!
//! A notification is itself proof of change, so the change detector is not
//! consulted. The last stored event only decides the event type:
//! - create/modify on a live path is `Changed`, otherwise `Added`
//! - delete on a path with no live event is dropped
//!
//! # Lifecycle
//!
//! The task runs until the location's token is cancelled or the
//! subscription closes. Pending changes are flushed before it returns, and
//! `stop` waits for this task before closing the queue, so nothing flushed
//! at shutdown is lost.

use std::{collections::HashMap, sync::Arc};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{DetectionError, LocationInner};
use crate::{
  domain::event::{EventSource, FileEvent, FileEventType},
  storage::{WatchKind, WatchNotification, WatchSubscription},
};

// ============================================================================
// Debouncing
// ============================================================================

/// A change that is being debounced
#[derive(Debug)]
struct PendingChange {
  kind: WatchKind,
  last_event: Instant,
}

impl PendingChange {
  fn new(kind: WatchKind) -> Self {
    Self {
      kind,
      last_event: Instant::now(),
    }
  }

  /// Fold a newer notification for the same path into this one
  fn update(&mut self, kind: WatchKind) {
    self.last_event = Instant::now();

    match (self.kind, kind) {
      // Still a create as far as the store is concerned
      (WatchKind::Created, WatchKind::Modified) => {
        trace!("Coalescing create+modify -> create");
      }
      (WatchKind::Deleted, WatchKind::Created) => {
        self.kind = WatchKind::Modified;
        trace!("Coalescing delete+create -> modified");
      }
      (WatchKind::Created, WatchKind::Deleted) => {
        self.kind = WatchKind::Deleted;
        trace!("Coalescing create+delete -> delete");
      }
      _ => self.kind = kind,
    }
  }
}

// ============================================================================
// WatcherTask
// ============================================================================

pub(super) struct WatcherTask {
  inner: Arc<LocationInner>,
  // Holds the native watcher alive along with the channel
  subscription: WatchSubscription,
  cancel: CancellationToken,
  pending: HashMap<String, PendingChange>,
}

impl WatcherTask {
  pub(super) fn spawn(
    inner: Arc<LocationInner>,
    subscription: WatchSubscription,
    cancel: CancellationToken,
  ) -> JoinHandle<()> {
    let task = Self {
      inner,
      subscription,
      cancel,
      pending: HashMap::new(),
    };
    tokio::spawn(task.run())
  }

  async fn run(mut self) {
    let debounce = self.inner.options.watch_debounce();
    info!(location = %self.inner.name(), debounce_ms = debounce.as_millis(), "WatcherTask started");

    let mut debounce_interval = tokio::time::interval(debounce.max(std::time::Duration::from_millis(1)));

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          debug!(location = %self.inner.name(), "WatcherTask shutting down (cancelled)");
          break;
        }

        notification = self.subscription.events.recv() => {
          match notification {
            Some(notification) => self.record(notification),
            None => {
              debug!(location = %self.inner.name(), "WatcherTask shutting down (subscription closed)");
              break;
            }
          }
        }

        _ = debounce_interval.tick() => {
          self.flush_settled(debounce).await;
        }
      }
    }

    // Drain whatever the provider already delivered
    while let Ok(notification) = self.subscription.events.try_recv() {
      self.record(notification);
    }
    if !self.pending.is_empty() {
      debug!(location = %self.inner.name(), pending = self.pending.len(), "Flushing pending changes on shutdown");
      self.flush_all().await;
    }

    self.inner.watching.store(false, std::sync::atomic::Ordering::SeqCst);
    info!(location = %self.inner.name(), "WatcherTask stopped");
  }

  fn record(&mut self, notification: WatchNotification) {
    let WatchNotification { path, kind } = notification;

    if !self.inner.filter.matches(&path) {
      trace!(location = %self.inner.name(), path = %path, "Skipping filtered path");
      return;
    }

    trace!(location = %self.inner.name(), path = %path, kind = ?kind, "Notification");
    match self.pending.get_mut(&path) {
      Some(existing) => existing.update(kind),
      None => {
        self.pending.insert(path, PendingChange::new(kind));
      }
    }
  }

  /// Emit changes that have been quiet for a full debounce period
  async fn flush_settled(&mut self, debounce: std::time::Duration) {
    let now = Instant::now();
    let mut settled: Vec<String> = self
      .pending
      .iter()
      .filter(|(_, change)| now.duration_since(change.last_event) >= debounce)
      .map(|(path, _)| path.clone())
      .collect();

    if settled.is_empty() {
      return;
    }
    settled.sort();

    let batch = Uuid::now_v7();
    debug!(location = %self.inner.name(), count = settled.len(), batch = %batch, "Flushing settled changes");
    for path in settled {
      if let Some(change) = self.pending.remove(&path) {
        self.flush(path, change.kind, batch).await;
      }
    }
  }

  async fn flush_all(&mut self) {
    let mut changes: Vec<(String, PendingChange)> = self.pending.drain().collect();
    changes.sort_by(|a, b| a.0.cmp(&b.0));

    let batch = Uuid::now_v7();
    for (path, change) in changes {
      self.flush(path, change.kind, batch).await;
    }
  }

  /// Emit one settled change; `batch` correlates everything flushed together
  async fn flush(&self, path: String, kind: WatchKind, batch: Uuid) {
    if let Err(e) = self.emit_change(&path, kind, batch).await {
      self.inner.detection_error(Some(&path), e.to_string());
    }
  }

  async fn emit_change(&self, path: &str, kind: WatchKind, batch: Uuid) -> Result<(), DetectionError> {
    let inner = &self.inner;
    let last = inner.store.get_latest_event(inner.name(), path).await?;
    let live = last.as_ref().is_some_and(|e| e.event_type != FileEventType::Deleted);

    if kind == WatchKind::Deleted {
      return self.emit_deleted(path, live, batch).await;
    }

    let metadata = match inner.provider.get_file_info(path).await {
      Ok(metadata) => metadata,
      // Gone again before we got to it
      Err(e) if e.is_not_found() => return self.emit_deleted(path, live, batch).await,
      Err(e) => return Err(e.into()),
    };
    if metadata.is_directory {
      return Ok(());
    }

    let checksum = if inner.detector.requires_checksum() {
      match inner.provider.get_checksum(path).await {
        Ok(checksum) => Some(checksum),
        Err(e) if e.is_not_found() => return self.emit_deleted(path, live, batch).await,
        Err(e) => return Err(e.into()),
      }
    } else {
      None
    };

    let event_type = if live { FileEventType::Changed } else { FileEventType::Added };
    let event = FileEvent::new(inner.name(), path, event_type, EventSource::Watcher)
      .with_correlation(batch)
      .with_metadata(&metadata)
      .with_checksum(checksum);
    inner.emit(event).await;
    Ok(())
  }

  async fn emit_deleted(&self, path: &str, live: bool, batch: Uuid) -> Result<(), DetectionError> {
    if !live {
      trace!(location = %self.inner.name(), path, "Dropping delete for path with no live event");
      return Ok(());
    }
    let event =
      FileEvent::new(self.inner.name(), path, FileEventType::Deleted, EventSource::Watcher).with_correlation(batch);
    self.inner.emit(event).await;
    Ok(())
  }
}
