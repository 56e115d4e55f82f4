//! The per-location processing loop.
//!
//! One loop per running location. Each iteration: honour pause, wait
//! (bounded) for an event, take a rate-limit token, then dequeue and run the
//! event through the processor chain. Failures are recorded on the event and
//! published; nothing a processor does can end the loop.

use std::sync::{Arc, atomic::Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LocationInner;
use crate::{
  domain::event::{EventStatus, FileEvent},
  events::MonitorEvent,
  processor::ProcessingContext,
};

pub(super) async fn run(inner: Arc<LocationInner>, cancel: CancellationToken) {
  info!(location = %inner.name(), "Processing loop started");
  let poll = inner.options.queue_poll_interval();

  loop {
    if cancel.is_cancelled() {
      break;
    }

    if inner.is_paused() {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = inner.resume.notified() => {}
        _ = tokio::time::sleep(poll) => {}
      }
      continue;
    }

    let ready = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      ready = inner.queue.wait_for_item(poll) => ready,
    };
    if !ready {
      continue;
    }

    if !inner.limiter.acquire(&cancel).await {
      break;
    }

    // Pause takes this lock to wait out the current event
    let _dispatch = inner.dispatch.lock().await;
    if inner.is_paused() || cancel.is_cancelled() {
      continue;
    }
    // Flagged before the dequeue so the queue never looks idle mid-handoff
    inner.in_flight.store(true, Ordering::SeqCst);
    let Some(event) = inner.queue.try_dequeue() else {
      inner.in_flight.store(false, Ordering::SeqCst);
      continue;
    };

    process_event(&inner, event, &cancel).await;
    inner.in_flight.store(false, Ordering::SeqCst);
  }

  info!(location = %inner.name(), backlog = inner.queue.len(), "Processing loop stopped");
}

/// Run one event through the chain and persist the outcome
async fn process_event(inner: &LocationInner, mut event: FileEvent, cancel: &CancellationToken) {
  event.status = EventStatus::Processing;
  if let Err(e) = inner.store.store_event(&event).await {
    warn!(location = %inner.name(), path = %event.file_path, error = %e, "Failed to mark event processing");
  }

  inner.publisher.publish(MonitorEvent::BeforeProcessing {
    location: inner.name().to_string(),
    event_id: event.id,
    path: event.file_path.clone(),
    event_type: event.event_type,
  });

  let mut ctx = ProcessingContext::new(event, inner.provider.clone(), cancel.clone());
  let results = inner.chain.run(&mut ctx).await;
  let mut event = ctx.event;

  for result in results.iter().filter(|r| !r.success) {
    inner.publisher.publish(MonitorEvent::ProcessingError {
      location: inner.name().to_string(),
      event_id: event.id,
      path: event.file_path.clone(),
      processor: result.processor_name.clone(),
      message: result.message.clone(),
    });
  }

  event.complete(results.clone());

  {
    let mut stats = inner.stats();
    stats.processed += 1;
    if event.status == EventStatus::Failed {
      stats.failed += 1;
      stats.last_error = results.iter().find(|r| !r.success).map(|r| r.message.clone());
    }
  }

  if let Err(e) = inner.store.store_event(&event).await {
    warn!(location = %inner.name(), path = %event.file_path, error = %e, "Failed to store processed event");
  }
  for result in &results {
    if let Err(e) = inner.store.store_processing_result(result).await {
      warn!(
        location = %inner.name(),
        processor = %result.processor_name,
        error = %e,
        "Failed to store processing result"
      );
    }
  }

  debug!(
    location = %inner.name(),
    path = %event.file_path,
    event_type = %event.event_type,
    status = ?event.status,
    results = results.len(),
    "Event processed"
  );

  inner.publisher.publish(MonitorEvent::AfterProcessing { event });
}
