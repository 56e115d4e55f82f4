//! Storage providers - where monitored files actually live
//!
//! A location talks to its storage only through `StorageProvider`. Paths are
//! always `/`-separated and relative to the provider root; the empty string is
//! the root itself.
//!
//! Listing is paginated with an opaque continuation token: `None` asks for the
//! first page, and a `None` coming back means the listing is exhausted.
//!
//! Providers that can push native change notifications report
//! `supports_real_time_watching() == true` and hand out a `WatchSubscription`
//! from `watch()`. Notifications are delivered on an unbounded channel so the
//! native callback never blocks.

mod local;
mod memory;

use std::{any::Any, sync::Arc};

pub use local::LocalStorageProvider;
pub use memory::MemoryStorageProvider;
use tokio::sync::mpsc;

use crate::domain::{config::StorageOptions, metadata::FileMetadata, pattern::PathFilter};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Path escapes the storage root: {0}")]
  OutsideRoot(String),
  #[error("Not a directory: {0}")]
  NotADirectory(String),
  #[error("Directory not empty: {0}")]
  DirectoryNotEmpty(String),
  #[error("Invalid listing pattern: {0}")]
  InvalidPattern(String),
  #[error("I/O error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to walk directory: {0}")]
  Walk(#[from] walkdir::Error),
  #[error("Real-time watching is not supported by {0}")]
  WatchUnsupported(String),
  #[error("Failed to start watcher: {0}")]
  Watch(#[from] notify::Error),
  #[error("Storage task failed: {0}")]
  Task(String),
}

impl StorageError {
  pub(crate) fn io(path: &str, source: std::io::Error) -> Self {
    if source.kind() == std::io::ErrorKind::NotFound {
      Self::NotFound(path.to_string())
    } else {
      Self::Io {
        path: path.to_string(),
        source,
      }
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound(_))
  }
}

// ============================================================================
// Listing & watching types
// ============================================================================

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListing {
  pub paths: Vec<String>,
  /// Pass back to fetch the next page. `None` means this was the last page.
  pub continuation: Option<String>,
}

/// Kind of a native change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
  Created,
  Modified,
  Deleted,
}

/// A native change notification, already made relative to the provider root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchNotification {
  pub path: String,
  pub kind: WatchKind,
}

impl WatchNotification {
  pub fn new(path: impl Into<String>, kind: WatchKind) -> Self {
    Self {
      path: path.into(),
      kind,
    }
  }
}

/// Live watch on a provider. Watching stops when this is dropped.
pub struct WatchSubscription {
  pub events: mpsc::UnboundedReceiver<WatchNotification>,
  // Keeps the native watcher alive
  _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl WatchSubscription {
  pub fn new(events: mpsc::UnboundedReceiver<WatchNotification>) -> Self {
    Self { events, _guard: None }
  }

  pub fn with_guard(events: mpsc::UnboundedReceiver<WatchNotification>, guard: impl Any + Send + Sync) -> Self {
    Self {
      events,
      _guard: Some(Box::new(guard)),
    }
  }
}

impl std::fmt::Debug for WatchSubscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WatchSubscription")
      .field("guarded", &self._guard.is_some())
      .finish()
  }
}

// ============================================================================
// Provider trait
// ============================================================================

#[async_trait::async_trait]
pub trait StorageProvider: Send + Sync {
  fn name(&self) -> &str;

  async fn exists(&self, path: &str) -> Result<bool, StorageError>;
  async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError>;
  async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), StorageError>;
  async fn delete_file(&self, path: &str) -> Result<(), StorageError>;

  /// Hex-encoded content checksum
  async fn get_checksum(&self, path: &str) -> Result<String, StorageError>;
  async fn get_file_info(&self, path: &str) -> Result<FileMetadata, StorageError>;

  /// List files (never directories) under `path` whose relative path matches
  /// `pattern`. Pages hold at most `page_size` entries.
  async fn list_files(
    &self,
    path: &str,
    pattern: &str,
    recursive: bool,
    continuation: Option<&str>,
    page_size: usize,
  ) -> Result<FileListing, StorageError>;

  async fn is_directory(&self, path: &str) -> Result<bool, StorageError>;
  async fn create_directory(&self, path: &str) -> Result<(), StorageError>;
  async fn delete_directory(&self, path: &str, recursive: bool) -> Result<(), StorageError>;

  async fn check_health(&self) -> bool;

  fn supports_real_time_watching(&self) -> bool {
    false
  }

  fn watch(&self, _recursive: bool) -> Result<WatchSubscription, StorageError> {
    Err(StorageError::WatchUnsupported(self.name().to_string()))
  }
}

impl dyn StorageProvider {
  /// Build the provider a location's options ask for
  pub fn from_options(options: &StorageOptions) -> Arc<dyn StorageProvider> {
    match options {
      StorageOptions::Local { root } => Arc::new(LocalStorageProvider::new(root.clone())),
      StorageOptions::Memory => Arc::new(MemoryStorageProvider::new()),
    }
  }
}

// ============================================================================
// Path helpers shared by providers
// ============================================================================

/// Normalize a relative path: `/` separators, no leading `./` or `/`, no
/// trailing `/`.
pub(crate) fn normalize_path(path: &str) -> String {
  let path = path.replace('\\', "/");
  path
    .split('/')
    .filter(|segment| !segment.is_empty() && *segment != ".")
    .collect::<Vec<_>>()
    .join("/")
}

/// Whether `path` lies under `dir` (both normalized). The root contains everything.
pub(crate) fn is_under(path: &str, dir: &str) -> bool {
  dir.is_empty() || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

pub(crate) fn listing_filter(pattern: &str) -> Result<PathFilter, StorageError> {
  PathFilter::new(pattern, &[], &[]).map_err(|e| StorageError::InvalidPattern(e.to_string()))
}

/// Cut one page out of a sorted list of paths, resuming after `continuation`
pub(crate) fn paginate(sorted: Vec<String>, continuation: Option<&str>, page_size: usize) -> FileListing {
  let page_size = page_size.max(1);
  let start = match continuation {
    Some(token) => sorted.partition_point(|p| p.as_str() <= token),
    None => 0,
  };

  let remaining = sorted.len().saturating_sub(start);
  let paths: Vec<String> = sorted.into_iter().skip(start).take(page_size).collect();
  let continuation = if remaining > page_size { paths.last().cloned() } else { None };

  FileListing { paths, continuation }
}
