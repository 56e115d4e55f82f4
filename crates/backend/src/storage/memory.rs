//! In-memory storage, for tests and for embedding filepulse in other programs.
//!
//! Modification times are explicit so callers can drive timestamp detection
//! deterministically. When built `with_real_time_watching`, every mutation is
//! also pushed to live watch subscriptions.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::{
    Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use super::{
  FileListing, StorageError, StorageProvider, WatchKind, WatchNotification, WatchSubscription, is_under, listing_filter,
  normalize_path, paginate,
};
use crate::domain::metadata::FileMetadata;

#[derive(Debug, Clone)]
struct MemoryFile {
  contents: Vec<u8>,
  modified: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MemoryStorageProvider {
  files: RwLock<BTreeMap<String, MemoryFile>>,
  directories: RwLock<BTreeSet<String>>,
  /// Upper bound on page size regardless of what the caller asks for
  max_page_size: Option<usize>,
  real_time: bool,
  healthy: AtomicBool,
  subscribers: Mutex<Vec<mpsc::UnboundedSender<WatchNotification>>>,
}

impl Default for MemoryStorageProvider {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStorageProvider {
  pub fn new() -> Self {
    Self {
      files: RwLock::new(BTreeMap::new()),
      directories: RwLock::new(BTreeSet::new()),
      max_page_size: None,
      real_time: false,
      healthy: AtomicBool::new(true),
      subscribers: Mutex::new(Vec::new()),
    }
  }

  /// Force small listing pages, to exercise continuation handling
  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.max_page_size = Some(page_size.max(1));
    self
  }

  pub fn with_real_time_watching(mut self) -> Self {
    self.real_time = true;
    self
  }

  pub fn set_healthy(&self, healthy: bool) {
    self.healthy.store(healthy, Ordering::SeqCst);
  }

  /// Insert or replace a file with an explicit modification time
  pub fn put_file(&self, path: &str, contents: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
    let path = normalize_path(path);
    let existed = self
      .files_mut()
      .insert(path.clone(), MemoryFile {
        contents: contents.into(),
        modified,
      })
      .is_some();
    self.notify(path, if existed { WatchKind::Modified } else { WatchKind::Created });
  }

  /// Bump a file's modification time without touching its contents
  pub fn touch(&self, path: &str, modified: DateTime<Utc>) -> bool {
    let path = normalize_path(path);
    let touched = match self.files_mut().get_mut(&path) {
      Some(file) => {
        file.modified = modified;
        true
      }
      None => false,
    };
    if touched {
      self.notify(path, WatchKind::Modified);
    }
    touched
  }

  /// Remove a file, returning whether it existed
  pub fn remove(&self, path: &str) -> bool {
    let path = normalize_path(path);
    let removed = self.files_mut().remove(&path).is_some();
    if removed {
      self.notify(path, WatchKind::Deleted);
    }
    removed
  }

  pub fn file_count(&self) -> usize {
    self.files().len()
  }

  fn files(&self) -> RwLockReadGuard<'_, BTreeMap<String, MemoryFile>> {
    self.files.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn files_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, MemoryFile>> {
    self.files.write().unwrap_or_else(PoisonError::into_inner)
  }

  fn directories_mut(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
    self.directories.write().unwrap_or_else(PoisonError::into_inner)
  }

  fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<WatchNotification>>> {
    self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn notify(&self, path: String, kind: WatchKind) {
    if !self.real_time {
      return;
    }
    let notification = WatchNotification::new(path, kind);
    self
      .subscribers()
      .retain(|tx| tx.send(notification.clone()).is_ok());
  }

  fn file(&self, path: &str) -> Result<MemoryFile, StorageError> {
    self
      .files()
      .get(&normalize_path(path))
      .cloned()
      .ok_or_else(|| StorageError::NotFound(path.to_string()))
  }

  fn is_dir_sync(&self, path: &str) -> bool {
    let path = normalize_path(path);
    if path.is_empty() {
      return true;
    }
    let explicit = self
      .directories
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(&path);
    explicit || self.files().keys().any(|file| is_under(file, &path))
  }
}

#[async_trait::async_trait]
impl StorageProvider for MemoryStorageProvider {
  fn name(&self) -> &str {
    "memory"
  }

  async fn exists(&self, path: &str) -> Result<bool, StorageError> {
    let is_file = self.files().contains_key(&normalize_path(path));
    Ok(is_file || self.is_dir_sync(path))
  }

  async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
    Ok(self.file(path)?.contents)
  }

  async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), StorageError> {
    self.put_file(path, contents, Utc::now());
    Ok(())
  }

  async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
    if self.remove(path) {
      Ok(())
    } else {
      Err(StorageError::NotFound(path.to_string()))
    }
  }

  async fn get_checksum(&self, path: &str) -> Result<String, StorageError> {
    let file = self.file(path)?;
    Ok(hex::encode(Sha256::digest(&file.contents)))
  }

  async fn get_file_info(&self, path: &str) -> Result<FileMetadata, StorageError> {
    let relative = normalize_path(path);
    match self.file(path) {
      Ok(file) => Ok(FileMetadata::file(relative, file.contents.len() as u64, Some(file.modified))),
      Err(_) if self.is_dir_sync(path) => Ok(FileMetadata::directory(relative)),
      Err(e) => Err(e),
    }
  }

  async fn list_files(
    &self,
    path: &str,
    pattern: &str,
    recursive: bool,
    continuation: Option<&str>,
    page_size: usize,
  ) -> Result<FileListing, StorageError> {
    let filter = listing_filter(pattern)?;
    let dir = normalize_path(path);

    // BTreeMap keys are already sorted
    let paths: Vec<String> = self
      .files()
      .keys()
      .filter(|file| is_under(file, &dir))
      .filter(|file| {
        recursive || {
          let rest = if dir.is_empty() { file.as_str() } else { &file[dir.len() + 1..] };
          !rest.contains('/')
        }
      })
      .filter(|file| filter.matches(file))
      .cloned()
      .collect();

    let page_size = self.max_page_size.map_or(page_size, |max| page_size.min(max));
    Ok(paginate(paths, continuation, page_size))
  }

  async fn is_directory(&self, path: &str) -> Result<bool, StorageError> {
    Ok(self.is_dir_sync(path))
  }

  async fn create_directory(&self, path: &str) -> Result<(), StorageError> {
    self.directories_mut().insert(normalize_path(path));
    Ok(())
  }

  async fn delete_directory(&self, path: &str, recursive: bool) -> Result<(), StorageError> {
    let dir = normalize_path(path);
    if !self.is_dir_sync(&dir) {
      return Err(StorageError::NotFound(path.to_string()));
    }

    let children: Vec<String> = self
      .files()
      .keys()
      .filter(|file| is_under(file, &dir))
      .cloned()
      .collect();

    if !children.is_empty() && !recursive {
      return Err(StorageError::DirectoryNotEmpty(path.to_string()));
    }

    for child in children {
      self.remove(&child);
    }
    self
      .directories_mut()
      .retain(|d| d != &dir && !is_under(d, &dir));
    Ok(())
  }

  async fn check_health(&self) -> bool {
    self.healthy.load(Ordering::SeqCst)
  }

  fn supports_real_time_watching(&self) -> bool {
    self.real_time
  }

  fn watch(&self, _recursive: bool) -> Result<WatchSubscription, StorageError> {
    if !self.real_time {
      return Err(StorageError::WatchUnsupported(self.name().to_string()));
    }
    let (tx, rx) = mpsc::unbounded_channel();
    self.subscribers().push(tx);
    Ok(WatchSubscription::new(rx))
  }
}
