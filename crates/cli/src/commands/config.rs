//! Config commands

use std::path::Path;

use anyhow::Result;
use filepulse::config::MonitorConfig;

use super::load_config;

/// Show the effective configuration
pub fn cmd_config_show(explicit: Option<&Path>) -> Result<()> {
  let config = load_config(explicit)?;

  match MonitorConfig::resolve_path(explicit) {
    Some(path) if path.exists() => println!("Using config: {:?}", path),
    _ => println!("Using default configuration (no config file found)"),
  }
  println!();

  let toml_str = toml::to_string_pretty(&config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write a starter config file
pub fn cmd_config_init(explicit: Option<&Path>, force: bool) -> Result<()> {
  let Some(config_path) = MonitorConfig::resolve_path(explicit) else {
    eprintln!("Could not determine user config path");
    std::process::exit(1);
  };

  if config_path.exists() && !force {
    eprintln!("Config file already exists: {:?}", config_path);
    println!("Use --force to overwrite it");
    std::process::exit(1);
  }

  if let Some(parent) = config_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&config_path, MonitorConfig::template())?;

  println!("Created config: {:?}", config_path);
  println!("Edit the [[locations]] entries, then run `filepulse run`.");

  Ok(())
}

/// Print which config file would be used
pub fn cmd_config_path(explicit: Option<&Path>) -> Result<()> {
  match MonitorConfig::resolve_path(explicit) {
    Some(path) => {
      let marker = if path.exists() { "" } else { " (not created yet)" };
      println!("{}{}", path.display(), marker);
    }
    None => println!("No config path available"),
  }
  Ok(())
}
