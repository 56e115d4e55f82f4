//! Location state machine: start/stop, pause/resume, restart.

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::helpers::*;
use crate::{
  domain::{config::LocationOptions, scan::ScanOptions},
  events::MonitorEvent,
  location::{LocationError, LocationStatus},
  processor::Processor,
  storage::MemoryStorageProvider,
};

fn on_demand(name: &str) -> LocationOptions {
  LocationOptions {
    on_demand_only: true,
    ..test_options(name)
  }
}

#[tokio::test]
async fn test_status_transitions_are_published() {
  let loc = TestLocation::new(test_options("docs"));
  let mut rx = loc.publisher().subscribe();

  assert_eq!(loc.handler.status(), LocationStatus::Stopped);
  loc.handler.start().await.expect("start");
  assert_eq!(loc.handler.status(), LocationStatus::Running);
  loc.handler.pause().await.expect("pause");
  assert_eq!(loc.handler.status(), LocationStatus::Paused);
  assert!(loc.handler.is_active());
  loc.handler.resume().await.expect("resume");
  loc.handler.stop().await.expect("stop");
  assert_eq!(loc.handler.status(), LocationStatus::Stopped);

  let transitions: Vec<(LocationStatus, LocationStatus)> = drain(&mut rx)
    .into_iter()
    .filter_map(|e| match e {
      MonitorEvent::LocationStatusChanged { previous, current, .. } => Some((previous, current)),
      _ => None,
    })
    .collect();

  use LocationStatus::*;
  assert_eq!(
    transitions,
    vec![
      (Stopped, Starting),
      (Starting, Running),
      (Running, Paused),
      (Paused, Running),
      (Running, Stopping),
      (Stopping, Stopped),
    ]
  );
}

#[tokio::test]
async fn test_lifecycle_misuse() {
  let loc = TestLocation::new(on_demand("docs"));

  assert!(matches!(loc.handler.pause().await, Err(LocationError::NotRunning(_))));
  assert!(matches!(loc.handler.resume().await, Err(LocationError::NotRunning(_))));
  assert!(matches!(
    loc.handler.scan(ScanOptions::default()).await,
    Err(LocationError::NotRunning(_))
  ));
  // Stopping a stopped location is fine
  loc.handler.stop().await.expect("stop while stopped");

  loc.handler.start().await.expect("start");
  assert!(matches!(loc.handler.start().await, Err(LocationError::AlreadyRunning(_))));
  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_unhealthy_storage_refuses_to_start() {
  let loc = TestLocation::new(test_options("docs"));
  loc.storage.set_healthy(false);

  assert!(matches!(loc.handler.start().await, Err(LocationError::Unhealthy(_))));
  assert_eq!(loc.handler.status(), LocationStatus::Stopped);

  loc.storage.set_healthy(true);
  loc.handler.start().await.expect("start once healthy");
  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_paused_location_accumulates_backlog() {
  let loc = TestLocation::new(on_demand("docs"));
  loc.handler.start().await.expect("start");
  loc.handler.pause().await.expect("pause");

  for name in ["a", "b", "c"] {
    loc.storage.put_file(name, name, at(0));
  }
  let ctx = loc.handler.scan(ScanOptions::default()).await.expect("scan while paused");
  assert_eq!(ctx.events.len(), 3);
  assert_eq!(loc.handler.queue_size(), 3);

  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(loc.handler.queue_size(), 3);
  assert!(loc.recorder.seen().is_empty());
  assert!(!loc.handler.wait_for_queue_empty(Duration::from_millis(50)).await);

  loc.handler.resume().await.expect("resume");
  loc.settle().await;
  assert_eq!(loc.recorder.paths(), vec!["a", "b", "c"]);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_pause_waits_for_in_flight_event() {
  let slow: Arc<dyn Processor> = Arc::new(SlowProcessor {
    delay: Duration::from_millis(150),
  });
  let loc = TestLocation::build(test_options("docs"), MemoryStorageProvider::new(), vec![slow]);
  loc.storage.put_file("a", "a", at(0));
  loc.storage.put_file("b", "b", at(0));
  loc.handler.start().await.expect("start");

  // Let the loop pick up the first event
  for _ in 0..100 {
    if loc.handler.in_flight() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }

  loc.handler.pause().await.expect("pause");
  assert!(!loc.handler.in_flight());

  let processed = loc.handler.stats().processed as usize;
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(loc.handler.stats().processed as usize, processed);
  assert_eq!(processed + loc.handler.queue_size(), 2);

  loc.handler.resume().await.expect("resume");
  loc.settle().await;
  assert_eq!(loc.handler.stats().processed, 2);
  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_pause_overtaken_by_stop_leaves_location_stopped() {
  let slow: Arc<dyn Processor> = Arc::new(SlowProcessor {
    delay: Duration::from_millis(150),
  });
  let loc = TestLocation::build(test_options("docs"), MemoryStorageProvider::new(), vec![slow]);
  loc.storage.put_file("a", "a", at(0));
  loc.handler.start().await.expect("start");

  for _ in 0..100 {
    if loc.handler.in_flight() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert!(loc.handler.in_flight());

  // Pause parks on the in-flight event; stop takes over meanwhile
  let (paused, stopped) = tokio::join!(loc.handler.pause(), async {
    tokio::task::yield_now().await;
    loc.handler.stop().await
  });

  stopped.expect("stop");
  assert!(matches!(paused, Err(LocationError::NotRunning(_))));
  assert_eq!(loc.handler.status(), LocationStatus::Stopped);
  assert!(!loc.handler.is_active());
  assert!(!loc.handler.is_paused());

  // Still startable, which a stale Paused status would prevent
  loc.handler.start().await.expect("restart after stop");
  assert_eq!(loc.handler.status(), LocationStatus::Running);
  loc.handler.stop().await.expect("stop");
  assert!(matches!(loc.handler.resume().await, Err(LocationError::NotRunning(_))));
}

#[tokio::test]
async fn test_backlog_survives_stop_and_start() {
  let options = LocationOptions {
    scan_on_start: false,
    ..test_options("docs")
  };
  let loc = TestLocation::new(options);
  loc.handler.start().await.expect("start");
  loc.handler.pause().await.expect("pause");

  loc.storage.put_file("a", "a", at(0));
  loc.storage.put_file("b", "b", at(0));
  loc.handler.scan(ScanOptions::default()).await.expect("scan");

  loc.handler.stop().await.expect("stop");
  assert_eq!(loc.handler.queue_size(), 2);
  assert!(loc.recorder.seen().is_empty());

  // Start clears the pause and drains what was left
  loc.handler.start().await.expect("restart");
  assert!(!loc.handler.is_paused());
  loc.settle().await;
  assert_eq!(loc.recorder.paths(), vec!["a", "b"]);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_on_demand_location_neither_scans_nor_watches() {
  let storage = MemoryStorageProvider::new().with_real_time_watching();
  let loc = TestLocation::build(on_demand("docs"), storage, Vec::new());
  loc.storage.put_file("a", "a", at(0));

  loc.handler.start().await.expect("start");
  assert!(!loc.handler.is_watching());
  assert!(loc.handler.is_queue_empty());
  assert!(loc.events().is_empty());

  // A forced rescan on restart still runs
  loc.handler.restart(true).await.expect("restart");
  loc.settle().await;
  assert_eq!(loc.recorder.paths(), vec!["a"]);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_restart_without_rescan() {
  let loc = TestLocation::new(test_options("docs"));
  loc.storage.put_file("a", "a", at(0));
  loc.handler.start().await.expect("start");
  loc.settle().await;

  loc.storage.put_file("b", "b", at(0));
  loc.handler.restart(false).await.expect("restart");
  assert_eq!(loc.handler.status(), LocationStatus::Running);
  assert!(loc.handler.is_queue_empty());
  assert_eq!(loc.events_of(crate::domain::event::FileEventType::Added), vec!["a"]);

  loc.handler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_status_report() {
  let loc = TestLocation::new(test_options("docs"));
  loc.storage.put_file("a", "a", at(0));
  loc.handler.start().await.expect("start");
  loc.settle().await;

  let report = loc.handler.status_report();
  assert_eq!(report.name, "docs");
  assert_eq!(report.status, LocationStatus::Running);
  assert!(!report.paused);
  assert_eq!(report.queue_size, 0);
  assert_eq!(report.stats.detected, 1);
  assert_eq!(report.stats.processed, 1);
  assert!(report.stats.last_scan.is_some());

  let json = serde_json::to_value(&report).expect("serialize");
  assert_eq!(json["status"], "running");

  loc.handler.stop().await.expect("stop");
}
