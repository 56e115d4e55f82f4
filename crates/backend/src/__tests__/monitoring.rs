//! MonitoringService across several locations.

use std::{collections::HashMap, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::helpers::*;
use crate::{
  domain::{
    config::{LocationOptions, MonitorConfig, ProcessorOptions},
    event::{EventStatus, FileEventType},
    scan::ScanOptions,
  },
  events::MonitorEvent,
  location::{LocationDeps, LocationStatus},
  processor::Processor,
  service::{MonitoringService, ServiceError},
  storage::MemoryStorageProvider,
  store::MemoryEventStore,
};

struct Fixture {
  service: MonitoringService,
  store: Arc<MemoryEventStore>,
  recorder: Arc<RecordingProcessor>,
  docs: Arc<MemoryStorageProvider>,
  media: Arc<MemoryStorageProvider>,
}

fn fixture() -> Fixture {
  let service = MonitoringService::new();
  let store = Arc::new(MemoryEventStore::new());
  let recorder = RecordingProcessor::new("recorder");
  let docs = Arc::new(MemoryStorageProvider::new());
  let media = Arc::new(MemoryStorageProvider::new());

  for (name, storage) in [("docs", &docs), ("media", &media)] {
    let deps = LocationDeps::new(storage.clone(), store.clone()).with_processor(recorder.clone());
    service.add_location(test_options(name), deps).expect("add location");
  }

  Fixture {
    service,
    store,
    recorder,
    docs,
    media,
  }
}

#[tokio::test]
async fn test_start_and_stop_fan_out() {
  let f = fixture();
  f.docs.put_file("a.txt", "a", at(0));
  f.media.put_file("b.png", "b", at(0));
  f.media.put_file("c.png", "c", at(0));
  let mut rx = f.service.subscribe();

  f.service.start().await.expect("start");
  assert!(f.service.wait_for_queue_empty(SETTLE).await);

  let reports = f.service.get_all_location_status();
  let summary: Vec<(String, LocationStatus, u64)> = reports
    .into_iter()
    .map(|r| (r.name, r.status, r.stats.processed))
    .collect();
  assert_eq!(
    summary,
    vec![
      ("docs".to_string(), LocationStatus::Running, 1),
      ("media".to_string(), LocationStatus::Running, 2),
    ]
  );
  assert!(f.service.is_location_active("docs").expect("known"));

  let mut processed: Vec<String> = drain(&mut rx)
    .into_iter()
    .filter_map(|e| match e {
      MonitorEvent::AfterProcessing { event } => Some(format!("{}:{}", event.location_name, event.file_path)),
      _ => None,
    })
    .collect();
  processed.sort();
  assert_eq!(processed, vec!["docs:a.txt", "media:b.png", "media:c.png"]);

  f.service.stop().await.expect("stop");
  assert_eq!(f.service.get_location_status("docs").expect("known"), LocationStatus::Stopped);
  assert_eq!(f.service.get_location_status("media").expect("known"), LocationStatus::Stopped);
}

#[tokio::test]
async fn test_pausing_one_location_leaves_others_running() {
  let f = fixture();
  f.service.start().await.expect("start");
  f.service.pause_location("docs").await.expect("pause");

  f.docs.put_file("held.txt", "x", at(0));
  f.media.put_file("flows.png", "x", at(0));
  f.service.scan_location("docs", ScanOptions::default()).await.expect("scan docs");
  f.service.scan_location("media", ScanOptions::default()).await.expect("scan media");

  let media = f.service.location("media").expect("media");
  assert!(media.wait_for_queue_empty(SETTLE).await);
  assert_eq!(f.recorder.paths(), vec!["flows.png"]);
  assert_eq!(f.service.get_queue_size(), 1);
  assert_eq!(f.service.get_location_queue_size("docs").expect("known"), 1);
  assert!(!f.service.is_queue_empty());
  assert!(!f.service.wait_for_queue_empty(Duration::from_millis(50)).await);

  f.service.resume_location("docs").await.expect("resume");
  assert!(f.service.wait_for_queue_empty(SETTLE).await);
  assert_eq!(f.recorder.seen().len(), 2);

  f.service.stop().await.expect("stop");
}

#[tokio::test]
async fn test_disabled_processor_is_skipped() {
  let f = fixture();
  f.service.start().await.expect("start");

  assert_eq!(f.service.disable_processor("recorder"), 2);
  assert_eq!(f.service.disable_processor("nonexistent"), 0);

  f.docs.put_file("quiet.txt", "x", at(0));
  let ctx = f
    .service
    .scan_location("docs", ScanOptions::default().wait_for_processing(SETTLE))
    .await
    .expect("scan");
  assert_eq!(ctx.events.len(), 1);

  let stored = f.store.events_for("docs");
  assert_eq!(stored.len(), 1);
  assert_eq!(stored[0].status, EventStatus::Skipped);
  assert!(stored[0].processing_results.is_empty());
  assert!(f.recorder.seen().is_empty());

  f.service
    .set_processor_enabled("docs", "recorder", true)
    .expect("enable on docs");
  f.docs.put_file("loud.txt", "x", at(0));
  f.service
    .scan_location("docs", ScanOptions::default().wait_for_processing(SETTLE))
    .await
    .expect("scan");
  assert_eq!(f.recorder.paths(), vec!["loud.txt"]);

  assert!(matches!(
    f.service.set_processor_enabled("docs", "missing", true),
    Err(ServiceError::UnknownProcessor { .. })
  ));

  f.service.stop().await.expect("stop");
}

#[tokio::test]
async fn test_restart_and_remove_location() {
  let f = fixture();
  f.service.start().await.expect("start");

  f.docs.put_file("a.txt", "a", at(0));
  f.service.restart_location("docs", true).await.expect("restart");
  assert!(f.service.wait_for_queue_empty(SETTLE).await);
  assert_eq!(f.recorder.paths(), vec!["a.txt"]);

  f.service.remove_location("docs").await.expect("remove");
  assert_eq!(f.service.location_names(), vec!["media"]);
  assert!(matches!(
    f.service.scan_location("docs", ScanOptions::default()).await,
    Err(ServiceError::UnknownLocation(_))
  ));

  f.service.stop().await.expect("stop");
}

#[tokio::test]
async fn test_from_config_builds_memory_locations() {
  let config = MonitorConfig {
    locations: vec![
      LocationOptions {
        processors: vec![ProcessorOptions {
          name: "recorder".to_string(),
          ..Default::default()
        }],
        ..test_options("one")
      },
      test_options("two"),
    ],
    ..Default::default()
  };
  let recorder = RecordingProcessor::new("recorder");
  let processors: Vec<Arc<dyn Processor>> = vec![recorder.clone()];

  let service = MonitoringService::from_config(&config, Arc::new(MemoryEventStore::new()), processors, HashMap::new())
    .expect("from config");

  assert_eq!(service.location_names(), vec!["one", "two"]);
  let one = service.location("one").expect("one");
  assert_eq!(one.processor_names(), vec!["recorder"]);

  service.start().await.expect("start");
  let ctx = service
    .scan_location("two", ScanOptions::default())
    .await
    .expect("scan");
  assert!(ctx.events.is_empty());
  assert_eq!(ctx.events_of(FileEventType::Added).count(), 0);
  service.stop().await.expect("stop");
}

#[tokio::test]
async fn test_from_config_rejects_duplicate_names() {
  let config = MonitorConfig {
    locations: vec![test_options("dup"), test_options("dup")],
    ..Default::default()
  };
  let result = MonitoringService::from_config(&config, Arc::new(MemoryEventStore::new()), Vec::new(), HashMap::new());
  assert!(matches!(result, Err(ServiceError::Config(_))));
}
