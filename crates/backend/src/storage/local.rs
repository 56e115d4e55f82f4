//! Local filesystem storage rooted at a directory.

use std::{
  path::{Component, Path, PathBuf},
  time::Duration,
};

use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, event::RenameMode};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{
  FileListing, StorageError, StorageProvider, WatchKind, WatchNotification, WatchSubscription, listing_filter,
  normalize_path,
};
use crate::domain::metadata::FileMetadata;

/// Poll interval used by notify's fallback poll watcher
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LocalStorageProvider {
  root: PathBuf,
  name: String,
}

impl LocalStorageProvider {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    let name = format!("local:{}", root.display());
    Self { root, name }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Map a relative path onto the filesystem, refusing anything that climbs
  /// out of the root.
  fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
    let relative = normalize_path(path);
    let mut resolved = self.root.clone();
    for component in Path::new(&relative).components() {
      match component {
        Component::Normal(part) => resolved.push(part),
        Component::CurDir => {}
        _ => return Err(StorageError::OutsideRoot(path.to_string())),
      }
    }
    Ok(resolved)
  }

  fn relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
      .components()
      .filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
      })
      .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
  }
}

#[async_trait::async_trait]
impl StorageProvider for LocalStorageProvider {
  fn name(&self) -> &str {
    &self.name
  }

  async fn exists(&self, path: &str) -> Result<bool, StorageError> {
    let full = self.resolve(path)?;
    tokio::fs::try_exists(&full).await.map_err(|e| StorageError::io(path, e))
  }

  async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
    let full = self.resolve(path)?;
    tokio::fs::read(&full).await.map_err(|e| StorageError::io(path, e))
  }

  async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), StorageError> {
    let full = self.resolve(path)?;
    if let Some(parent) = full.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    }
    tokio::fs::write(&full, contents)
      .await
      .map_err(|e| StorageError::io(path, e))
  }

  async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
    let full = self.resolve(path)?;
    tokio::fs::remove_file(&full)
      .await
      .map_err(|e| StorageError::io(path, e))
  }

  async fn get_checksum(&self, path: &str) -> Result<String, StorageError> {
    let content = self.read_file(path).await?;
    Ok(hex::encode(Sha256::digest(&content)))
  }

  async fn get_file_info(&self, path: &str) -> Result<FileMetadata, StorageError> {
    let full = self.resolve(path)?;
    let meta = tokio::fs::metadata(&full)
      .await
      .map_err(|e| StorageError::io(path, e))?;

    let relative = normalize_path(path);
    if meta.is_dir() {
      return Ok(FileMetadata::directory(relative));
    }

    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
    Ok(FileMetadata::file(relative, meta.len(), modified))
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
    let start = self.resolve(path)?;
    let root = self.root.clone();
    let label = path.to_string();
    let token = continuation.map(str::to_string);
    let page_size = page_size.max(1);

    // walkdir is blocking; keep it off the runtime threads
    let listing = tokio::task::spawn_blocking(move || -> Result<FileListing, StorageError> {
      if !start.is_dir() {
        return Err(StorageError::NotADirectory(label));
      }

      // Visits files in the same order as sorting their relative paths, so
      // the walk can resume after the token instead of starting over
      let mut walker = walkdir::WalkDir::new(&start)
        .follow_links(false)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by(|a, b| listing_key(a).cmp(&listing_key(b)))
        .into_iter();

      let mut paths = Vec::with_capacity(page_size);
      let mut more = false;
      while let Some(entry) = walker.next() {
        let entry = match entry {
          Ok(entry) => entry,
          // Files vanishing mid-walk are normal on a live directory
          Err(e) if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => continue,
          Err(e) => return Err(e.into()),
        };
        let Some(relative) = Self::relative(&root, entry.path()) else {
          continue;
        };

        if entry.file_type().is_dir() {
          if token.as_deref().is_some_and(|token| subtree_before(&relative, token)) {
            walker.skip_current_dir();
          }
          continue;
        }
        if !entry.file_type().is_file() {
          continue;
        }
        if token.as_deref().is_some_and(|token| relative.as_str() <= token) || !filter.matches(&relative) {
          continue;
        }

        if paths.len() == page_size {
          more = true;
          break;
        }
        paths.push(relative);
      }

      let continuation = if more { paths.last().cloned() } else { None };
      Ok(FileListing { paths, continuation })
    })
    .await
    .map_err(|e| StorageError::Task(e.to_string()))??;

    trace!(root = %self.root.display(), files = listing.paths.len(), "Listed local files");
    Ok(listing)
  }

  async fn is_directory(&self, path: &str) -> Result<bool, StorageError> {
    let full = self.resolve(path)?;
    match tokio::fs::metadata(&full).await {
      Ok(meta) => Ok(meta.is_dir()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(StorageError::io(path, e)),
    }
  }

  async fn create_directory(&self, path: &str) -> Result<(), StorageError> {
    let full = self.resolve(path)?;
    tokio::fs::create_dir_all(&full)
      .await
      .map_err(|e| StorageError::io(path, e))
  }

  async fn delete_directory(&self, path: &str, recursive: bool) -> Result<(), StorageError> {
    let full = self.resolve(path)?;
    if full == self.root {
      return Err(StorageError::OutsideRoot(path.to_string()));
    }

    let result = if recursive {
      tokio::fs::remove_dir_all(&full).await
    } else {
      tokio::fs::remove_dir(&full).await
    };

    result.map_err(|e| match e.kind() {
      std::io::ErrorKind::DirectoryNotEmpty => StorageError::DirectoryNotEmpty(path.to_string()),
      _ => StorageError::io(path, e),
    })
  }

  async fn check_health(&self) -> bool {
    match tokio::fs::metadata(&self.root).await {
      Ok(meta) => meta.is_dir(),
      Err(e) => {
        warn!(root = %self.root.display(), error = %e, "Storage root unavailable");
        false
      }
    }
  }

  fn supports_real_time_watching(&self) -> bool {
    true
  }

  fn watch(&self, recursive: bool) -> Result<WatchSubscription, StorageError> {
    // Notify reports canonical paths on some platforms (e.g. /private/var on macOS)
    let canonical = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
    let root = self.root.clone();
    let (tx, rx) = mpsc::unbounded_channel();

    let config = Config::default().with_poll_interval(WATCH_POLL_INTERVAL);
    let mut watcher = RecommendedWatcher::new(
      move |res: Result<Event, notify::Error>| match res {
        Ok(event) => {
          for notification in translate(&canonical, &root, &event) {
            // Receiver gone means the subscription was dropped
            let _ = tx.send(notification);
          }
        }
        Err(e) => warn!(error = %e, "Watcher error"),
      },
      config,
    )?;

    let mode = if recursive {
      RecursiveMode::Recursive
    } else {
      RecursiveMode::NonRecursive
    };
    watcher.watch(&self.root, mode)?;

    info!(root = %self.root.display(), recursive, "Watching local storage");
    Ok(WatchSubscription::with_guard(rx, watcher))
  }
}

/// Sort key for one directory entry. Directories sort as `name/`, which
/// makes a depth-first walk yield relative paths in plain string order.
fn listing_key(entry: &walkdir::DirEntry) -> String {
  let mut key = entry.file_name().to_string_lossy().into_owned();
  if entry.file_type().is_dir() {
    key.push('/');
  }
  key
}

/// Whether every path under `dir` sorts at or before `token`
fn subtree_before(dir: &str, token: &str) -> bool {
  let prefix = format!("{dir}/");
  !token.starts_with(&prefix) && prefix.as_str() < token
}

/// Turn one notify event into zero or more relative notifications
fn translate(canonical: &Path, root: &Path, event: &Event) -> Vec<WatchNotification> {
  let relative = |path: &Path| {
    LocalStorageProvider::relative(canonical, path).or_else(|| LocalStorageProvider::relative(root, path))
  };

  let mut out = Vec::new();

  if let EventKind::Modify(notify::event::ModifyKind::Name(RenameMode::Both)) = event.kind
    && let [from, to, ..] = event.paths.as_slice()
  {
    if let Some(from) = relative(from) {
      out.push(WatchNotification::new(from, WatchKind::Deleted));
    }
    if !to.is_dir()
      && let Some(to) = relative(to)
    {
      out.push(WatchNotification::new(to, WatchKind::Created));
    }
    return out;
  }

  for path in &event.paths {
    let kind = match event.kind {
      EventKind::Create(_) => WatchKind::Created,
      EventKind::Modify(notify::event::ModifyKind::Name(RenameMode::From)) => WatchKind::Deleted,
      EventKind::Modify(notify::event::ModifyKind::Name(RenameMode::To)) => WatchKind::Created,
      // Generic renames: whichever side still exists was the target
      EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
        if path.exists() {
          WatchKind::Modified
        } else {
          WatchKind::Deleted
        }
      }
      EventKind::Modify(_) => WatchKind::Modified,
      EventKind::Remove(_) => WatchKind::Deleted,
      EventKind::Access(_) | EventKind::Any | EventKind::Other => {
        trace!(path = %path.display(), kind = ?event.kind, "Ignoring event");
        continue;
      }
    };

    if kind != WatchKind::Deleted && path.is_dir() {
      continue;
    }

    match relative(path) {
      Some(relative) => out.push(WatchNotification::new(relative, kind)),
      None => debug!(path = %path.display(), "Notification outside storage root"),
    }
  }

  out
}
