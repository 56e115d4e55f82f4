//! Domain types - core monitoring entities
//!
//! This module contains the canonical types that flow through the monitoring
//! pipeline. They are independent of any storage backend or event store and
//! carry no behaviour beyond small constructors and state transitions.

pub mod config;
pub mod event;
pub mod metadata;
pub mod pattern;
pub mod scan;
