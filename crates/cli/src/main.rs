//! filepulse CLI - monitor storage locations and process file changes

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;
mod processor;

use commands::{ScanArgs, cmd_config_init, cmd_config_path, cmd_config_show, cmd_run, cmd_scan, load_config};
use logging::{init_cli_logging, init_file_logging};

#[derive(Parser)]
#[command(name = "filepulse")]
#[command(about = "Watch storage locations and run file changes through processors")]
#[command(after_help = "\
QUICK START:
  filepulse config init           # Write a starter config
  filepulse run                   # Monitor every configured location
  filepulse scan inbox --wait     # One-off scan of a single location")]
struct Cli {
  /// Config file (default: $FILEPULSE_CONFIG or the user config dir)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `filepulse config`
#[derive(Subcommand)]
enum ConfigCommand {
  /// Show the effective configuration as TOML
  Show,
  /// Write a starter config file
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
  /// Print the config file path that would be used
  Path,
}

#[derive(Subcommand)]
enum Commands {
  /// Start every configured location and process events until Ctrl-C
  Run {
    /// Log to a rotating file instead of the console
    #[arg(long)]
    log_file: bool,
  },
  /// Scan one location once and print the scan summary as JSON
  #[command(after_help = "\
NOTE:
  The event store lives in memory for the duration of the command, so every
  file present is reported as added.")]
  Scan {
    /// Location name
    location: String,
    /// Wait until every detected event has been processed
    #[arg(long)]
    wait: bool,
    /// Only consider paths matching these globs
    #[arg(long)]
    include: Vec<String>,
    /// Skip paths matching these globs
    #[arg(long)]
    exclude: Vec<String>,
    /// Stop after this many files
    #[arg(long)]
    max_files: Option<usize>,
    /// Compare timestamps even on checksum locations
    #[arg(long)]
    skip_checksum: bool,
  },
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let config_path = cli.config;

  let command = match cli.command {
    Commands::Config { command } => {
      return match command {
        ConfigCommand::Show => cmd_config_show(config_path.as_deref()),
        ConfigCommand::Init { force } => cmd_config_init(config_path.as_deref(), force),
        ConfigCommand::Path => cmd_config_path(config_path.as_deref()),
      };
    }
    other => other,
  };

  let config = load_config(config_path.as_deref())?;

  // File logging only for long-running monitoring
  let _guard = match &command {
    Commands::Run { log_file: true } => init_file_logging(&config.logging),
    _ => {
      init_cli_logging(&config.logging);
      None
    }
  };

  match command {
    Commands::Run { .. } => cmd_run(config).await,
    Commands::Scan {
      location,
      wait,
      include,
      exclude,
      max_files,
      skip_checksum,
    } => {
      cmd_scan(config, ScanArgs {
        location,
        wait,
        include,
        exclude,
        max_files,
        skip_checksum,
      })
      .await
    }
    Commands::Config { .. } => Ok(()),
  }
}
