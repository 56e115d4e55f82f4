use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-agnostic description of a file, produced by a storage provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
  pub path: String,
  pub length: u64,
  pub last_modified: Option<DateTime<Utc>>,
  pub is_directory: bool,
  #[serde(default)]
  pub custom: HashMap<String, String>,
}

impl FileMetadata {
  pub fn file(path: impl Into<String>, length: u64, last_modified: Option<DateTime<Utc>>) -> Self {
    Self {
      path: path.into(),
      length,
      last_modified,
      is_directory: false,
      custom: HashMap::new(),
    }
  }

  pub fn directory(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      length: 0,
      last_modified: None,
      is_directory: true,
      custom: HashMap::new(),
    }
  }
}
