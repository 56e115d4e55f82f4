//! Configuration for the monitoring service and its locations.
//!
//! Config priority: explicit path > `$FILEPULSE_CONFIG` > user
//! (`~/.config/filepulse/config.toml`) > defaults.
//!
//! Options are immutable once a `LocationHandler` has been built from them.

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

use super::pattern::PathFilter;

// ============================================================================
// Errors
// ============================================================================

/// Invalid location or processor setup. Always fatal at construction/start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Location name must not be empty")]
  EmptyLocationName,
  #[error("Duplicate location: {0}")]
  DuplicateLocation(String),
  #[error("Invalid rate limit for location {location}: {reason}")]
  InvalidRateLimit { location: String, reason: String },
  #[error("Invalid pattern: {0}")]
  InvalidPattern(String),
  #[error("Duplicate processor {processor} in location {location}")]
  DuplicateProcessor { location: String, processor: String },
  #[error("Unknown processor {processor} in location {location}")]
  UnknownProcessor { location: String, processor: String },
  #[error("Unknown behavior {behavior} on processor {processor}")]
  UnknownBehavior { processor: String, behavior: String },
  #[error("Invalid retry behavior on processor {processor}: {reason}")]
  InvalidRetry { processor: String, reason: String },
  #[error("Storage backend {storage} is not available here")]
  UnsupportedStorage { storage: String },
  #[error("Failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

// ============================================================================
// Top-level config
// ============================================================================

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
  pub logging: LoggingConfig,
  pub locations: Vec<LocationOptions>,
}

impl MonitorConfig {
  /// Load from an explicit file. Missing or malformed files are errors here,
  /// unlike `load_default` which falls back to defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Load from `$FILEPULSE_CONFIG` or the user config path, else defaults
  pub fn load_default() -> Result<Self, ConfigError> {
    match Self::resolve_path(None) {
      Some(path) if path.exists() => Self::load(&path),
      _ => Ok(Self::default()),
    }
  }

  /// Resolve which config file would be used
  pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
      return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("FILEPULSE_CONFIG") {
      return Some(PathBuf::from(path));
    }

    Self::user_config_path()
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("filepulse").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("filepulse").join("config.toml"))
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for location in &self.locations {
      location.validate()?;
      if !names.insert(location.name.as_str()) {
        return Err(ConfigError::DuplicateLocation(location.name.clone()));
      }
    }
    Ok(())
  }

  /// Render a commented starter config
  pub fn template() -> String {
    let example = Self {
      logging: LoggingConfig::default(),
      locations: vec![LocationOptions {
        processors: vec![ProcessorOptions {
          behaviors: vec![BehaviorOptions::Logging, BehaviorOptions::Retry(RetryOptions::default())],
          ..ProcessorOptions::new("log")
        }],
        ..LocationOptions::new("inbox", StorageOptions::Local {
          root: PathBuf::from("/srv/inbox"),
        })
      }],
    };
    let body = toml::to_string_pretty(&example).unwrap_or_default();
    format!("# filepulse configuration\n# Each [[locations]] entry is monitored independently.\n\n{body}")
  }

  pub fn location(&self, name: &str) -> Option<&LocationOptions> {
    self.locations.iter().find(|l| l.name == name)
  }
}

/// Logging settings consumed by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// off | error | warn | info | debug | trace
  pub level: String,
  /// hourly | daily | never
  pub rotation: String,
  /// Directory for log files (defaults to the user data dir)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      rotation: "daily".to_string(),
      directory: None,
    }
  }
}

// ============================================================================
// Location options
// ============================================================================

/// Which storage backend a location lives on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageOptions {
  /// A directory on the local filesystem
  Local { root: PathBuf },
  /// Process-local in-memory storage
  Memory,
}

impl StorageOptions {
  pub fn kind(&self) -> &'static str {
    match self {
      StorageOptions::Local { .. } => "local",
      StorageOptions::Memory => "memory",
    }
  }
}

/// How the scanner decides whether a listed file changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDetection {
  /// Compare modification times (cheap)
  #[default]
  Timestamp,
  /// Compare content checksums computed by the provider (accurate)
  Checksum,
}

/// Per-location configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationOptions {
  pub name: String,
  pub storage: StorageOptions,
  /// Glob matched against location-relative paths
  pub file_pattern: String,
  pub recursive: bool,
  /// Never watch, never scan on start; only explicit scans detect changes
  pub on_demand_only: bool,
  /// Run a reconciliation scan when the location starts
  pub scan_on_start: bool,
  pub change_detection: ChangeDetection,
  pub rate_limit: RateLimitOptions,
  /// Ordered processor chain. Empty means "every supplied processor, in order".
  pub processors: Vec<ProcessorOptions>,
  /// Listing page size requested from the provider
  pub scan_page_size: usize,
  /// Upper bound on a single wait in the processing loop
  pub queue_poll_interval_ms: u64,
  /// Window in which watcher notifications for one path are coalesced
  pub watch_debounce_ms: u64,
}

impl Default for LocationOptions {
  fn default() -> Self {
    Self {
      name: String::new(),
      storage: StorageOptions::Memory,
      file_pattern: "*".to_string(),
      recursive: true,
      on_demand_only: false,
      scan_on_start: true,
      change_detection: ChangeDetection::Timestamp,
      rate_limit: RateLimitOptions::default(),
      processors: Vec::new(),
      scan_page_size: 500,
      queue_poll_interval_ms: 100,
      watch_debounce_ms: 50,
    }
  }
}

impl LocationOptions {
  pub fn new(name: impl Into<String>, storage: StorageOptions) -> Self {
    Self {
      name: name.into(),
      storage,
      ..Default::default()
    }
  }

  pub fn queue_poll_interval(&self) -> Duration {
    Duration::from_millis(self.queue_poll_interval_ms.max(1))
  }

  pub fn watch_debounce(&self) -> Duration {
    Duration::from_millis(self.watch_debounce_ms)
  }

  pub fn path_filter(&self) -> Result<PathFilter, ConfigError> {
    PathFilter::new(&self.file_pattern, &[], &[])
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.name.trim().is_empty() {
      return Err(ConfigError::EmptyLocationName);
    }

    self.rate_limit.validate(&self.name)?;
    self.path_filter()?;

    let mut seen = HashSet::new();
    for processor in &self.processors {
      if !seen.insert(processor.name.as_str()) {
        return Err(ConfigError::DuplicateProcessor {
          location: self.name.clone(),
          processor: processor.name.clone(),
        });
      }
      for behavior in &processor.behaviors {
        if let BehaviorOptions::Retry(retry) = behavior {
          retry.validate(&processor.name)?;
        }
      }
    }

    Ok(())
  }
}

/// Slowest accepted rate, one event every ~11.5 days
pub const MIN_EVENTS_PER_SECOND: f64 = 1e-6;

/// Token-bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOptions {
  /// Steady-state refill rate
  pub events_per_second: f64,
  /// Bucket capacity, i.e. how many events may run back to back after idling
  pub max_burst_size: u32,
}

impl Default for RateLimitOptions {
  fn default() -> Self {
    Self {
      events_per_second: 100.0,
      max_burst_size: 1000,
    }
  }
}

impl RateLimitOptions {
  pub fn new(events_per_second: f64, max_burst_size: u32) -> Self {
    Self {
      events_per_second,
      max_burst_size,
    }
  }

  fn validate(&self, location: &str) -> Result<(), ConfigError> {
    if !self.events_per_second.is_finite() || self.events_per_second < MIN_EVENTS_PER_SECOND {
      return Err(ConfigError::InvalidRateLimit {
        location: location.to_string(),
        reason: format!(
          "events_per_second must be at least {MIN_EVENTS_PER_SECOND}, got {}",
          self.events_per_second
        ),
      });
    }
    if self.max_burst_size == 0 {
      return Err(ConfigError::InvalidRateLimit {
        location: location.to_string(),
        reason: "max_burst_size must be at least 1".to_string(),
      });
    }
    Ok(())
  }
}

// ============================================================================
// Processor options
// ============================================================================

/// One entry of a location's processor chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorOptions {
  pub name: String,
  pub enabled: bool,
  /// Upper bound for a single processor attempt
  pub timeout_ms: Option<u64>,
  /// Attached behaviours; the last one listed runs outermost
  pub behaviors: Vec<BehaviorOptions>,
}

impl Default for ProcessorOptions {
  fn default() -> Self {
    Self {
      name: String::new(),
      enabled: true,
      timeout_ms: None,
      behaviors: Vec::new(),
    }
  }
}

impl ProcessorOptions {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Default::default()
    }
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_ms.map(Duration::from_millis)
  }
}

/// A behaviour attached to a processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BehaviorOptions {
  Logging,
  Retry(RetryOptions),
  /// A behaviour registered by name in `LocationDeps::behaviors`
  Custom { name: String },
}

/// Retry behaviour parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
  pub max_retries: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub backoff_multiplier: f64,
  pub jitter: bool,
}

impl Default for RetryOptions {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_backoff_ms: 200,
      max_backoff_ms: 10_000,
      backoff_multiplier: 2.0,
      jitter: true,
    }
  }
}

impl RetryOptions {
  fn validate(&self, processor: &str) -> Result<(), ConfigError> {
    if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
      return Err(ConfigError::InvalidRetry {
        processor: processor.to_string(),
        reason: format!("backoff_multiplier must be >= 1.0, got {}", self.backoff_multiplier),
      });
    }
    Ok(())
  }
}
