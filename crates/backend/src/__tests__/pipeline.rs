//! Scan -> queue -> chain -> store, end to end on in-memory storage.

use std::{collections::HashSet, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::helpers::*;
use crate::{
  domain::{
    config::{LocationOptions, RateLimitOptions},
    event::{EventSource, EventStatus, FileEventType},
    scan::{ScanOptions, ScanState},
  },
  events::MonitorEvent,
  processor::Processor,
  storage::MemoryStorageProvider,
  store::EventStore,
};

#[tokio::test]
async fn test_added_changed_deleted_with_checksums() {
  let loc = TestLocation::with_checksums("docs");
  loc.storage.put_file("a.txt", "alpha", at(0));
  loc.storage.put_file("b.txt", "beta", at(0));

  loc.handler.start().await.expect("start");
  loc.settle().await;

  assert_eq!(loc.recorder.paths(), vec!["a.txt", "b.txt"]);
  assert_eq!(loc.events_of(FileEventType::Added), vec!["a.txt", "b.txt"]);

  // New content, a bare touch, and a brand new file
  loc.storage.put_file("a.txt", "alpha v2", at(10));
  loc.storage.touch("b.txt", at(20));
  loc.storage.put_file("c.txt", "gamma", at(20));

  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert_eq!(ctx.state, ScanState::Completed);
  assert_eq!(ctx.processed_items, 3);
  assert_eq!(ctx.detected_changes.changed, 1);
  assert_eq!(ctx.detected_changes.added, 1);
  assert_eq!(ctx.detected_changes.deleted, 0);
  loc.settle().await;

  loc.storage.remove("b.txt");
  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert_eq!(ctx.events.len(), 1);
  assert_eq!(ctx.events[0].file_path, "b.txt");
  assert_eq!(ctx.events[0].event_type, FileEventType::Deleted);
  loc.settle().await;

  let seen: Vec<(String, FileEventType)> = loc
    .recorder
    .seen()
    .into_iter()
    .map(|s| (s.path, s.event_type))
    .collect();
  assert_eq!(
    seen,
    vec![
      ("a.txt".to_string(), FileEventType::Added),
      ("b.txt".to_string(), FileEventType::Added),
      ("a.txt".to_string(), FileEventType::Changed),
      ("c.txt".to_string(), FileEventType::Added),
      ("b.txt".to_string(), FileEventType::Deleted),
    ]
  );

  for event in loc.events() {
    assert_eq!(event.status, EventStatus::Completed, "{}", event.file_path);
    assert_eq!(event.source, EventSource::Scanner);
    assert_eq!(event.processing_results.len(), 1);
  }

  let present = loc.store.get_present_paths("docs").await.expect("present");
  assert_eq!(present, HashSet::from(["a.txt".to_string(), "c.txt".to_string()]));

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_reappearing_file_is_added_not_changed() {
  let loc = TestLocation::new(test_options("docs"));
  loc.storage.put_file("a.txt", "one", at(0));
  loc.handler.start().await.expect("start");
  loc.settle().await;

  loc.storage.remove("a.txt");
  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert_eq!(ctx.detected_changes.deleted, 1);
  loc.settle().await;

  loc.storage.put_file("a.txt", "one", at(0));
  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert_eq!(ctx.events.len(), 1);
  assert_eq!(ctx.events[0].event_type, FileEventType::Added);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_rescan_without_changes_emits_nothing() {
  let loc = TestLocation::new(test_options("docs"));
  for name in ["a", "b", "c"] {
    loc.storage.put_file(name, name, at(0));
  }
  loc.handler.start().await.expect("start");

  // Pending events already count as the last known state
  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert!(ctx.events.is_empty());
  assert_eq!(ctx.processed_items, 3);

  loc.settle().await;
  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert!(ctx.events.is_empty());
  assert_eq!(loc.recorder.seen().len(), 3);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_events_processed_in_queue_order() {
  let storage = MemoryStorageProvider::new().with_page_size(4);
  let mut expected = Vec::new();
  for i in 0..25 {
    let path = format!("f{i:02}.dat");
    storage.put_file(&path, vec![i as u8], at(i));
    expected.push(path);
  }

  let loc = TestLocation::build(test_options("bulk"), storage, Vec::new());
  loc.handler.start().await.expect("start");
  loc.settle().await;

  assert_eq!(loc.recorder.paths(), expected);
  assert_eq!(loc.handler.stats().processed, 25);
  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_failing_processor_does_not_stop_chain() {
  let failing: Arc<dyn Processor> = Arc::new(FailingProcessor {
    needle: "bad".to_string(),
  });
  let loc = TestLocation::build(test_options("docs"), MemoryStorageProvider::new(), vec![failing]);
  loc.storage.put_file("bad.txt", "x", at(0));
  loc.storage.put_file("good.txt", "y", at(0));
  let mut rx = loc.publisher().subscribe();

  loc.handler.start().await.expect("start");
  loc.settle().await;

  // Recorder runs first and still saw both
  assert_eq!(loc.recorder.paths(), vec!["bad.txt", "good.txt"]);

  let events = loc.events();
  let bad = events.iter().find(|e| e.file_path == "bad.txt").expect("bad");
  let good = events.iter().find(|e| e.file_path == "good.txt").expect("good");
  assert_eq!(bad.status, EventStatus::Failed);
  assert_eq!(good.status, EventStatus::Completed);

  let results = loc.store.get_processing_results(bad.id).await.expect("results");
  assert_eq!(results.len(), 2);
  assert!(results.iter().any(|r| r.processor_name == "recorder" && r.success));
  assert!(
    results
      .iter()
      .any(|r| r.processor_name == "failing" && !r.success && r.message.contains("refusing bad.txt"))
  );

  let stats = loc.handler.stats();
  assert_eq!(stats.processed, 2);
  assert_eq!(stats.failed, 1);

  let errors: Vec<_> = drain(&mut rx)
    .into_iter()
    .filter_map(|e| match e {
      MonitorEvent::ProcessingError { path, processor, .. } => Some((path, processor)),
      _ => None,
    })
    .collect();
  assert_eq!(errors, vec![("bad.txt".to_string(), "failing".to_string())]);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_processed_one_at_a_time_in_queue_order() {
  let options = LocationOptions {
    scan_on_start: false,
    scan_page_size: 5,
    ..test_options("docs")
  };
  let tracker = Arc::new(ConcurrencyTracker::default());
  let loc = TestLocation::build(
    options,
    MemoryStorageProvider::new().with_real_time_watching(),
    vec![tracker.clone() as Arc<dyn Processor>],
  );
  // Present before the watch starts, so only the scan reports these
  for i in 0..30 {
    loc.storage.put_file(&format!("scanned/{i:02}.txt"), "s", at(0));
  }
  let mut rx = loc.publisher().subscribe();
  loc.handler.start().await.expect("start");

  // The scan and the watcher task enqueue at the same time
  let scan_options = ScanOptions {
    include_patterns: vec!["scanned/**".to_string()],
    ..Default::default()
  };
  let (scan, ()) = tokio::join!(loc.handler.scan(scan_options), async {
    for i in 0..30 {
      loc.storage.put_file(&format!("watched/{i:02}.txt"), "w", at(0));
      tokio::task::yield_now().await;
    }
  });
  assert_eq!(scan.expect("scan").events.len(), 30);

  for _ in 0..500 {
    if loc.handler.stats().processed == 60 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  loc.settle().await;
  assert_eq!(loc.handler.stats().processed, 60);

  let published = drain(&mut rx);
  let received: Vec<_> = published
    .iter()
    .filter_map(|e| match e {
      MonitorEvent::FileEventReceived { event } => Some(event.id),
      _ => None,
    })
    .collect();
  let processed: Vec<_> = published
    .iter()
    .filter_map(|e| match e {
      MonitorEvent::BeforeProcessing { event_id, .. } => Some(*event_id),
      _ => None,
    })
    .collect();
  assert_eq!(received.len(), 60);
  assert_eq!(processed, received);

  let sources: HashSet<EventSource> = loc.recorder.seen().iter().map(|s| s.source).collect();
  assert_eq!(sources.len(), 2);
  assert_eq!(tracker.max_concurrent(), 1);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_panicking_processor_is_contained() {
  let loc = TestLocation::build(
    test_options("docs"),
    MemoryStorageProvider::new(),
    vec![Arc::new(PanickingProcessor) as Arc<dyn Processor>],
  );
  loc.storage.put_file("a.txt", "x", at(0));
  loc.storage.put_file("b.txt", "y", at(0));

  loc.handler.start().await.expect("start");
  loc.settle().await;

  // The loop survived the first panic and handled the second event too
  assert_eq!(loc.recorder.paths(), vec!["a.txt", "b.txt"]);
  assert!(loc.events().iter().all(|e| e.status == EventStatus::Failed));
  assert!(loc.handler.is_active());

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_panic_in_can_handle_is_contained() {
  let loc = TestLocation::build(
    test_options("docs"),
    MemoryStorageProvider::new(),
    vec![Arc::new(PanicsOnDecide { path: "bad.txt" }) as Arc<dyn Processor>],
  );
  loc.storage.put_file("bad.txt", "x", at(0));
  loc.storage.put_file("good.txt", "y", at(0));

  loc.handler.start().await.expect("start");
  assert!(loc.handler.wait_for_queue_empty(SETTLE).await);

  assert_eq!(loc.recorder.paths(), vec!["bad.txt", "good.txt"]);
  assert_eq!(loc.handler.stats().processed, 2);
  assert!(loc.handler.is_active());

  let events = loc.events();
  let bad = events.iter().find(|e| e.file_path == "bad.txt").expect("bad");
  assert_eq!(bad.status, EventStatus::Failed);
  let failed: Vec<_> = bad.processing_results.iter().filter(|r| !r.success).collect();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].processor_name, "decider");
  let good = events.iter().find(|e| e.file_path == "good.txt").expect("good");
  assert_eq!(good.status, EventStatus::Completed);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_scan_waits_for_processing() {
  let options = LocationOptions {
    scan_on_start: false,
    ..test_options("docs")
  };
  let loc = TestLocation::new(options);
  loc.storage.put_file("a.txt", "x", at(0));
  loc.storage.put_file("b.txt", "y", at(0));
  loc.handler.start().await.expect("start");

  let ctx = loc
    .handler
    .scan(ScanOptions::default().wait_for_processing(SETTLE))
    .await
    .expect("scan");

  assert_eq!(ctx.events.len(), 2);
  assert_eq!(ctx.properties.get("processing_complete"), Some(&serde_json::Value::Bool(true)));
  for event in &ctx.events {
    let stored = loc.store.get_event(event.id).await.expect("get").expect("stored");
    assert!(stored.status.is_terminal());
  }

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_caller_cancel_ends_wait_for_processing() {
  let options = LocationOptions {
    scan_on_start: false,
    ..test_options("docs")
  };
  let loc = TestLocation::new(options);
  loc.storage.put_file("a.txt", "x", at(0));
  loc.handler.start().await.expect("start");
  // Nothing gets processed while paused, so the wait can only end by cancellation
  loc.handler.pause().await.expect("pause");

  let cancel = tokio_util::sync::CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(100)).await;
    trigger.cancel();
  });

  let options = ScanOptions::default()
    .wait_for_processing(Duration::from_secs(600))
    .with_cancel(cancel);
  let ctx = tokio::time::timeout(Duration::from_secs(10), loc.handler.scan(options))
    .await
    .expect("wait should end when the caller cancels")
    .expect("scan");

  assert_eq!(ctx.events.len(), 1);
  assert_eq!(ctx.properties.get("processing_complete"), Some(&serde_json::Value::Bool(false)));
  assert_eq!(ctx.properties.get("processing_pending"), Some(&serde_json::json!(1)));

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_incomplete_scan_skips_deletions() {
  let options = LocationOptions {
    on_demand_only: true,
    ..test_options("docs")
  };
  let loc = TestLocation::new(options);
  for name in ["a", "b", "c", "d"] {
    loc.storage.put_file(name, name, at(0));
  }
  loc.handler.start().await.expect("start");

  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert_eq!(ctx.detected_changes.added, 4);
  loc.settle().await;

  loc.storage.remove("d");
  let capped = ScanOptions {
    max_files: Some(2),
    ..Default::default()
  };
  let ctx = loc.handler.scan(capped).await.expect("scan");
  assert!(ctx.cancelled);
  assert_eq!(ctx.processed_items, 2);
  assert_eq!(ctx.detected_changes.deleted, 0);

  // A full listing does report it
  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  assert_eq!(ctx.events_of(FileEventType::Deleted).count(), 1);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_scan_patterns_and_type_filter() {
  let options = LocationOptions {
    on_demand_only: true,
    ..test_options("docs")
  };
  let loc = TestLocation::new(options);
  loc.storage.put_file("keep.txt", "k", at(0));
  loc.storage.put_file("skip.log", "s", at(0));
  loc.handler.start().await.expect("start");

  let no_logs = || ScanOptions {
    exclude_patterns: vec!["*.log".to_string()],
    ..Default::default()
  };

  let ctx = loc.handler.scan(no_logs()).await.expect("scan");
  let paths: Vec<_> = ctx.events.iter().map(|e| e.file_path.as_str()).collect();
  assert_eq!(paths, vec!["keep.txt"]);

  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  let paths: Vec<_> = ctx.events.iter().map(|e| e.file_path.as_str()).collect();
  assert_eq!(paths, vec!["skip.log"]);
  loc.settle().await;

  loc.storage.remove("skip.log");
  loc.storage.remove("keep.txt");
  let ctx = loc
    .handler
    .scan(ScanOptions::default().only([FileEventType::Added]))
    .await
    .expect("scan");
  assert!(ctx.events.is_empty());

  // Excluded paths are never reported deleted
  let ctx = loc.handler.scan(no_logs()).await.expect("scan");
  let deleted: Vec<_> = ctx.events_of(FileEventType::Deleted).map(|e| e.file_path.clone()).collect();
  assert_eq!(deleted, vec!["keep.txt"]);

  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan");
  let deleted: Vec<_> = ctx.events_of(FileEventType::Deleted).map(|e| e.file_path.clone()).collect();
  assert_eq!(deleted, vec!["skip.log"]);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_scan_reports_progress_and_correlation() {
  let options = LocationOptions {
    on_demand_only: true,
    ..test_options("docs")
  };
  let loc = TestLocation::new(options);
  loc.storage.put_file("a", "a", at(0));
  loc.storage.put_file("b", "b", at(0));
  loc.handler.start().await.expect("start");

  let (tx, mut rx) = mpsc::channel(16);
  let ctx = loc
    .handler
    .scan(ScanOptions {
      progress: Some(tx),
      ..Default::default()
    })
    .await
    .expect("scan");

  let last = rx.recv().await.expect("final progress");
  assert_eq!(last.scan_id, ctx.scan_id);
  assert_eq!(last.processed_items, 2);
  assert_eq!(last.detected, 2);
  assert_eq!(last.current_file, None);

  assert!(ctx.events.iter().all(|e| e.correlation_id == ctx.scan_id));
  assert_eq!(loc.handler.stats().last_scan.map(|s| s.scan_id), Some(ctx.scan_id));

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_cancelled_scan_returns_partial_context() {
  let options = LocationOptions {
    on_demand_only: true,
    ..test_options("docs")
  };
  let loc = TestLocation::new(options);
  loc.storage.put_file("a", "a", at(0));
  loc.handler.start().await.expect("start");

  let cancel = tokio_util::sync::CancellationToken::new();
  cancel.cancel();
  let ctx = loc
    .handler
    .scan(ScanOptions::default().with_cancel(cancel))
    .await
    .expect("scan");

  assert!(ctx.cancelled);
  assert_eq!(ctx.processed_items, 0);
  assert!(ctx.events.is_empty());

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_rate_limit_spaces_out_processing() {
  let options = LocationOptions {
    rate_limit: RateLimitOptions {
      events_per_second: 20.0,
      max_burst_size: 1,
    },
    ..test_options("slow")
  };
  let loc = TestLocation::new(options);
  for i in 0..5 {
    loc.storage.put_file(&format!("f{i}"), "x", at(0));
  }

  let started = std::time::Instant::now();
  loc.handler.start().await.expect("start");
  loc.settle().await;

  // One token up front, then one every 50ms
  assert!(started.elapsed() >= Duration::from_millis(190), "{:?}", started.elapsed());
  assert_eq!(loc.recorder.seen().len(), 5);
  loc.handler.stop().await.expect("stop");
}
