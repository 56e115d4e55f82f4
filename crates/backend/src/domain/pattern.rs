//! Glob-based path filtering for locations and on-demand scans.
//!
//! Patterns use gitignore glob syntax via the `ignore` crate's override
//! matcher: `*.txt` matches at any depth, `docs/*.md` is anchored to the
//! location root, and `**` crosses directories.

use ignore::overrides::{Override, OverrideBuilder};

use super::config::ConfigError;

/// Decides whether a location-relative path takes part in monitoring.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
  /// The location's file pattern (`None` when it matches everything)
  file_pattern: Option<Override>,
  include: Option<Override>,
  exclude: Option<Override>,
}

impl PathFilter {
  /// A filter that accepts every path
  pub fn all() -> Self {
    Self::default()
  }

  pub fn new(file_pattern: &str, include: &[String], exclude: &[String]) -> Result<Self, ConfigError> {
    let file_pattern = match file_pattern.trim() {
      "" | "*" | "**" | "**/*" => None,
      pattern => Some(build_override(std::slice::from_ref(&pattern.to_string()))?),
    };

    Ok(Self {
      file_pattern,
      include: (!include.is_empty()).then(|| build_override(include)).transpose()?,
      exclude: (!exclude.is_empty()).then(|| build_override(exclude)).transpose()?,
    })
  }

  /// Check a `/`-separated path relative to the location root
  pub fn matches(&self, path: &str) -> bool {
    let path = path.trim_start_matches('/');

    if let Some(ref pattern) = self.file_pattern
      && !pattern.matched(path, false).is_whitelist()
    {
      return false;
    }

    if let Some(ref include) = self.include
      && !include.matched(path, false).is_whitelist()
    {
      return false;
    }

    if let Some(ref exclude) = self.exclude
      && exclude.matched(path, false).is_whitelist()
    {
      return false;
    }

    true
  }
}

fn build_override(patterns: &[String]) -> Result<Override, ConfigError> {
  let mut builder = OverrideBuilder::new("");
  for pattern in patterns {
    builder
      .add(pattern)
      .map_err(|e| ConfigError::InvalidPattern(format!("{pattern}: {e}")))?;
  }
  builder
    .build()
    .map_err(|e| ConfigError::InvalidPattern(e.to_string()))
}
