//! Unbounded FIFO of detected events feeding a location's processing loop.
//!
//! Many producers (watcher task, any number of concurrent scans) push; a
//! single consumer (the processing loop) pops. Pushing never blocks or awaits,
//! so it is safe to call from a notification callback. Waiting for work is
//! bounded by a timeout so the consumer can re-check pause and cancellation.

use std::{
  collections::VecDeque,
  sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use tokio::sync::Notify;

use crate::domain::event::FileEvent;

#[derive(Debug, Default)]
pub struct EventQueue {
  items: Mutex<VecDeque<FileEvent>>,
  available: Notify,
  closed: AtomicBool,
}

impl EventQueue {
  pub fn new() -> Self {
    Self::default()
  }

  fn items(&self) -> MutexGuard<'_, VecDeque<FileEvent>> {
    // The deque is never left half-updated, so a poisoned lock is still usable
    self.items.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Push an event. Returns the event back if the queue is closed.
  pub fn enqueue(&self, event: FileEvent) -> Result<(), FileEvent> {
    if self.is_closed() {
      return Err(event);
    }
    self.items().push_back(event);
    self.available.notify_one();
    Ok(())
  }

  pub fn try_dequeue(&self) -> Option<FileEvent> {
    self.items().pop_front()
  }

  /// Wait until the queue is non-empty, for at most `timeout`.
  ///
  /// Does not remove anything; returns whether an item is available.
  pub async fn wait_for_item(&self, timeout: Duration) -> bool {
    let notified = self.available.notified();
    tokio::pin!(notified);
    // Register interest before checking so a push in between is not lost
    notified.as_mut().enable();

    if !self.is_empty() {
      return true;
    }

    let _ = tokio::time::timeout(timeout, notified).await;
    !self.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items().is_empty()
  }

  /// Refuse further pushes. Queued events stay until drained or reopened.
  pub fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    self.available.notify_waiters();
  }

  pub fn reopen(&self) {
    self.closed.store(false, Ordering::SeqCst);
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }
}
