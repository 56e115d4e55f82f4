//! Scanner - pull-based reconciliation of storage against the event store.
//!
//! 1. Load the paths the store believes present.
//! 2. Page through the provider listing; for every path in scope, fetch
//!    metadata (and a checksum when the strategy needs one) and compare it to
//!    the path's last stored event.
//! 3. Once the listing is exhausted, every believed-present path that was not
//!    listed is reported deleted.
//!
//! Step 3 only runs after a complete listing: a cancelled, capped or failed
//! listing cannot prove a file is gone. The present set is held in memory,
//! so memory use grows with the number of files in the location.

use std::{collections::HashSet, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{DetectionError, LocationInner};
use crate::domain::{
  event::{EventSource, FileEvent, FileEventType},
  pattern::PathFilter,
  scan::{ScanContext, ScanOptions, ScanProgress, ScanState},
};

/// How often progress is reported, in listed files
const PROGRESS_EVERY: usize = 100;

pub(super) async fn scan(inner: &LocationInner, options: ScanOptions, cancel: &CancellationToken) -> ScanContext {
  let mut ctx = ScanContext::new(inner.name());
  let cancelled = || cancel.is_cancelled() || options.is_cancelled();

  // Patterns were validated by the caller
  let filter = PathFilter::new(
    &inner.options.file_pattern,
    &options.include_patterns,
    &options.exclude_patterns,
  )
  .unwrap_or_else(|_| inner.filter.clone());

  inner.publisher.publish(crate::events::MonitorEvent::ScanStarted {
    location: inner.name().to_string(),
    scan_id: ctx.scan_id,
  });
  for observer in &inner.observers {
    observer.on_scan_started(&ctx).await;
  }

  ctx.state = ScanState::InProgress;

  let present = match inner.store.get_present_paths(inner.name()).await {
    Ok(present) => Some(present),
    Err(e) => {
      let message = format!("Failed to load present paths: {e}");
      ctx.record_error(None, message.clone());
      inner.detection_error(None, message);
      None
    }
  };

  let page_size = options.batch_size.unwrap_or(inner.options.scan_page_size).max(1);
  let use_checksum = inner.detector.requires_checksum() && !options.skip_checksum;
  let mut current: HashSet<String> = HashSet::new();
  let mut complete = true;
  let mut token: Option<String> = None;

  'listing: loop {
    if cancelled() {
      ctx.cancelled = true;
      complete = false;
      break;
    }

    let page = match inner
      .provider
      .list_files("", &inner.options.file_pattern, inner.options.recursive, token.as_deref(), page_size)
      .await
    {
      Ok(page) => page,
      Err(e) => {
        let message = format!("Listing failed: {e}");
        ctx.record_error(None, message.clone());
        inner.detection_error(None, message);
        complete = false;
        break;
      }
    };

    trace!(location = %inner.name(), files = page.paths.len(), "Scanned page");

    for path in page.paths {
      if cancelled() {
        ctx.cancelled = true;
        complete = false;
        break 'listing;
      }
      if !filter.matches(&path) {
        continue;
      }
      if options.max_files.is_some_and(|max| ctx.processed_items >= max) {
        debug!(location = %inner.name(), max_files = ?options.max_files, "Scan reached max_files");
        ctx.cancelled = true;
        complete = false;
        break 'listing;
      }

      ctx.processed_items += 1;
      current.insert(path.clone());

      match detect_file(inner, &mut ctx, &options, &path, use_checksum).await {
        Ok(true) => {}
        // Vanished between listing and inspection; let deletion detection see it
        Ok(false) => {
          current.remove(&path);
        }
        Err(e) => {
          let message = e.to_string();
          ctx.record_error(Some(&path), message.clone());
          inner.detection_error(Some(&path), message);
        }
      }

      if ctx.processed_items % PROGRESS_EVERY == 0 {
        report_progress(&ctx, &options, Some(&path)).await;
      }
    }

    match page.continuation {
      Some(next) => token = Some(next),
      None => break,
    }
  }

  ctx.state = ScanState::Completing;

  match present {
    Some(present) if complete => detect_deletions(inner, &mut ctx, &options, &filter, present, &current).await,
    Some(_) => debug!(location = %inner.name(), "Listing incomplete, skipping deletion detection"),
    None => {}
  }

  report_progress(&ctx, &options, None).await;

  if options.wait_for_processing && !ctx.events.is_empty() {
    wait_for_processing(inner, &mut ctx, options.timeout, cancel, options.cancel.as_ref()).await;
  }

  ctx.end_time = Some(Utc::now());
  ctx.state = if listing_failed(&ctx) { ScanState::Failed } else { ScanState::Completed };

  let duration = ctx.duration().unwrap_or_default();
  for observer in &inner.observers {
    observer.on_scan_completed(&ctx, duration).await;
  }

  let summary = ctx.summary();
  inner.stats().last_scan = Some(summary.clone());
  inner
    .publisher
    .publish(crate::events::MonitorEvent::ScanCompleted { summary });

  ctx
}

/// A scan fails outright only when nothing could be listed at all
fn listing_failed(ctx: &ScanContext) -> bool {
  ctx.processed_items == 0 && !ctx.cancelled && !ctx.errors.is_empty()
}

/// Compare one listed file with its last event. Returns false if the file
/// disappeared before it could be inspected.
async fn detect_file(
  inner: &LocationInner,
  ctx: &mut ScanContext,
  options: &ScanOptions,
  path: &str,
  use_checksum: bool,
) -> Result<bool, DetectionError> {
  let metadata = match inner.provider.get_file_info(path).await {
    Ok(metadata) => metadata,
    Err(e) if e.is_not_found() => return Ok(false),
    Err(e) => return Err(e.into()),
  };
  if metadata.is_directory {
    return Ok(true);
  }

  let checksum = if use_checksum {
    match inner.provider.get_checksum(path).await {
      Ok(checksum) => Some(checksum),
      Err(e) if e.is_not_found() => return Ok(false),
      Err(e) => return Err(e.into()),
    }
  } else {
    None
  };

  let last = inner.store.get_latest_event(inner.name(), path).await?;
  let Some(event_type) = inner.detector.detect(&metadata, checksum.as_deref(), last.as_ref()) else {
    return Ok(true);
  };
  if !options.allows(event_type) {
    return Ok(true);
  }

  let event = FileEvent::new(inner.name(), path, event_type, EventSource::Scanner)
    .with_correlation(ctx.scan_id)
    .with_metadata(&metadata)
    .with_checksum(checksum);

  record(inner, ctx, event).await;
  Ok(true)
}

async fn detect_deletions(
  inner: &LocationInner,
  ctx: &mut ScanContext,
  options: &ScanOptions,
  filter: &PathFilter,
  present: HashSet<String>,
  current: &HashSet<String>,
) {
  if !options.allows(FileEventType::Deleted) {
    return;
  }

  let mut gone: Vec<String> = present
    .into_iter()
    .filter(|path| !current.contains(path) && filter.matches(path))
    .collect();
  gone.sort();

  for path in gone {
    // A watcher may have recorded the deletion since the present set was read
    match inner.store.get_latest_event(inner.name(), &path).await {
      Ok(Some(last)) if last.event_type == FileEventType::Deleted => continue,
      Ok(_) => {}
      Err(e) => {
        let message = e.to_string();
        ctx.record_error(Some(&path), message.clone());
        inner.detection_error(Some(&path), message);
        continue;
      }
    }

    let event = FileEvent::new(inner.name(), &path, FileEventType::Deleted, EventSource::Scanner)
      .with_correlation(ctx.scan_id);
    record(inner, ctx, event).await;
  }
}

/// Emit an event and account for it in the scan context
async fn record(inner: &LocationInner, ctx: &mut ScanContext, event: FileEvent) {
  ctx.record_event(event.clone());
  for observer in &inner.observers {
    observer.on_file_detected(ctx, &event).await;
  }
  inner.emit(event).await;
}

async fn report_progress(ctx: &ScanContext, options: &ScanOptions, current_file: Option<&str>) {
  if let Some(ref tx) = options.progress {
    let progress = ScanProgress {
      scan_id: ctx.scan_id,
      processed_items: ctx.processed_items,
      detected: ctx.detected_changes.total(),
      current_file: current_file.map(String::from),
    };
    let _ = tx.send(progress).await;
  }
}

/// Wait until every event this scan emitted has finished processing
async fn wait_for_processing(
  inner: &LocationInner,
  ctx: &mut ScanContext,
  timeout: Option<Duration>,
  cancel: &CancellationToken,
  caller: Option<&CancellationToken>,
) {
  let poll = inner.options.queue_poll_interval().min(Duration::from_millis(20));
  let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
  let mut pending: Vec<uuid::Uuid> = ctx.events.iter().map(|e| e.id).collect();

  loop {
    let mut still_pending = Vec::with_capacity(pending.len());
    for id in pending {
      let done = match inner.store.get_event(id).await {
        Ok(Some(event)) => event.status.is_terminal(),
        // Store trouble is already reported elsewhere; don't wait forever on it
        Ok(None) | Err(_) => true,
      };
      if !done {
        still_pending.push(id);
      }
    }
    pending = still_pending;

    if pending.is_empty() {
      ctx.set_property("processing_complete", true);
      return;
    }
    if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
      debug!(location = %inner.name(), pending = pending.len(), "Timed out waiting for processing");
      ctx.set_property("processing_complete", false);
      ctx.set_property("processing_pending", pending.len());
      return;
    }

    tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        ctx.set_property("processing_complete", false);
        return;
      }
      _ = caller_cancelled(caller) => {
        debug!(location = %inner.name(), pending = pending.len(), "Wait for processing cancelled by caller");
        ctx.set_property("processing_complete", false);
        ctx.set_property("processing_pending", pending.len());
        return;
      }
      _ = tokio::time::sleep(poll) => {}
    }
  }
}

/// Resolves when the caller's token fires; never without one
async fn caller_cancelled(caller: Option<&CancellationToken>) {
  match caller {
    Some(token) => token.cancelled().await,
    None => std::future::pending().await,
  }
}
