//! Watcher-driven detection through an in-memory provider with synthetic
//! notifications.

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::helpers::*;
use crate::{
  domain::{
    config::LocationOptions,
    event::{EventSource, FileEventType},
  },
  storage::MemoryStorageProvider,
};

fn watched(options: LocationOptions) -> TestLocation {
  TestLocation::build(options, MemoryStorageProvider::new().with_real_time_watching(), Vec::new())
}

fn no_initial_scan(name: &str) -> LocationOptions {
  LocationOptions {
    scan_on_start: false,
    ..test_options(name)
  }
}

/// Poll until `count` events are stored or time runs out
async fn wait_for_events(loc: &TestLocation, count: usize) {
  for _ in 0..200 {
    if loc.events().len() >= count {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("expected {count} events, have {:?}", loc.events());
}

#[tokio::test]
async fn test_watcher_reports_lifecycle_of_a_file() {
  let loc = watched(no_initial_scan("docs"));
  loc.handler.start().await.expect("start");
  assert!(loc.handler.is_watching());

  loc.storage.put_file("a.txt", "one", at(0));
  wait_for_events(&loc, 1).await;
  loc.settle().await;

  loc.storage.put_file("a.txt", "two", at(5));
  wait_for_events(&loc, 2).await;
  loc.settle().await;

  loc.storage.remove("a.txt");
  wait_for_events(&loc, 3).await;
  loc.settle().await;

  let seen: Vec<(String, FileEventType, EventSource)> = loc
    .recorder
    .seen()
    .into_iter()
    .map(|s| (s.path, s.event_type, s.source))
    .collect();
  assert_eq!(
    seen,
    vec![
      ("a.txt".to_string(), FileEventType::Added, EventSource::Watcher),
      ("a.txt".to_string(), FileEventType::Changed, EventSource::Watcher),
      ("a.txt".to_string(), FileEventType::Deleted, EventSource::Watcher),
    ]
  );

  let added = &loc.events()[0];
  assert_eq!(added.file_size, 3);
  assert_eq!(added.modification_time, Some(at(0)));

  loc.handler.stop().await.expect("stop");
  assert!(!loc.handler.is_watching());
}

#[tokio::test]
async fn test_create_then_delete_inside_debounce_is_dropped() {
  let options = LocationOptions {
    watch_debounce_ms: 100,
    ..no_initial_scan("docs")
  };
  let loc = watched(options);
  loc.handler.start().await.expect("start");

  loc.storage.put_file("blip.tmp", "x", at(0));
  loc.storage.remove("blip.tmp");
  loc.storage.put_file("kept.txt", "x", at(0));

  wait_for_events(&loc, 1).await;
  tokio::time::sleep(Duration::from_millis(250)).await;

  let paths: Vec<String> = loc.events().into_iter().map(|e| e.file_path).collect();
  assert_eq!(paths, vec!["kept.txt"]);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_watcher_honours_file_pattern() {
  let options = LocationOptions {
    file_pattern: "*.txt".to_string(),
    ..no_initial_scan("docs")
  };
  let loc = watched(options);
  loc.handler.start().await.expect("start");

  loc.storage.put_file("ignored.log", "x", at(0));
  loc.storage.put_file("wanted.txt", "x", at(0));
  wait_for_events(&loc, 1).await;
  tokio::time::sleep(Duration::from_millis(100)).await;

  assert_eq!(loc.events_of(FileEventType::Added), vec!["wanted.txt"]);
  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_watcher_and_scanner_agree() {
  let loc = watched(no_initial_scan("docs"));
  loc.handler.start().await.expect("start");

  loc.storage.put_file("a.txt", "one", at(0));
  wait_for_events(&loc, 1).await;
  loc.settle().await;

  // The scanner sees what the watcher already recorded
  let ctx = loc
    .handler
    .scan(crate::domain::scan::ScanOptions::default())
    .await
    .expect("scan");
  assert!(ctx.events.is_empty());

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_stop_flushes_pending_changes() {
  let options = LocationOptions {
    watch_debounce_ms: 10_000,
    ..no_initial_scan("docs")
  };
  let loc = watched(options);
  loc.handler.start().await.expect("start");

  loc.storage.put_file("late.txt", "x", at(0));
  // Give the watcher task a chance to receive the notification
  tokio::time::sleep(Duration::from_millis(50)).await;
  loc.handler.stop().await.expect("stop");

  let events = loc.events();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].file_path, "late.txt");
  assert_eq!(events[0].source, EventSource::Watcher);
}

#[tokio::test]
async fn test_changes_flushed_together_share_a_correlation() {
  let options = LocationOptions {
    watch_debounce_ms: 10_000,
    ..no_initial_scan("docs")
  };
  let loc = watched(options);
  loc.handler.start().await.expect("start");

  loc.storage.put_file("a.txt", "a", at(0));
  loc.storage.put_file("b.txt", "b", at(0));
  tokio::time::sleep(Duration::from_millis(50)).await;
  loc.handler.stop().await.expect("stop");

  loc.handler.start().await.expect("restart");
  loc.storage.put_file("c.txt", "c", at(0));
  tokio::time::sleep(Duration::from_millis(50)).await;
  loc.handler.stop().await.expect("stop again");

  let events = loc.events();
  assert_eq!(events.len(), 3);
  assert!(events.iter().all(|e| !e.correlation_id.is_nil()));
  assert_eq!(events[0].correlation_id, events[1].correlation_id);
  assert_ne!(events[1].correlation_id, events[2].correlation_id);
}
