//! filepulse - file-change monitoring and event processing
//!
//! Locations are watched and scanned for added, changed and deleted files.
//! Every detected change becomes a `FileEvent` that is queued, rate limited
//! and run through the location's processor chain, one event at a time.

pub mod detect;
pub mod domain;
pub mod events;
pub mod location;
pub mod observer;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod service;
pub mod storage;
pub mod store;

pub use domain::{config, event, scan};
pub use location::{LocationHandler, LocationStatus};
pub use service::{MonitoringService, ServiceError};
