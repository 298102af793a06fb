//! Serene CLI
//!
//! Command-line interface for Serene - stress measurements synced across
//! a phone and its companion watch.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use serene_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "serene")]
#[command(about = "Serene - Stress measurements synced between your devices")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use an alternate config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize this device (first-time setup)
    Init {
        /// Register this device as a companion (watch)
        #[arg(long)]
        companion: bool,
    },
    /// Device identity management
    Device {
        #[command(subcommand)]
        command: Option<DeviceCommands>,
    },
    /// Record a stress measurement
    #[command(alias = "add")]
    Record {
        /// Stress level (0-100)
        stress: f64,
        /// Heart rate variability in milliseconds
        hrv: f64,
        /// Resting heart rate in beats per minute
        rhr: f64,
        /// Per-sample confidence values (repeatable)
        #[arg(short, long)]
        confidence: Vec<f64>,
        /// Capture time (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,
    },
    /// List measurements
    #[command(alias = "ls")]
    List {
        /// Include deleted measurements
        #[arg(short, long)]
        all: bool,
        /// Show at most this many measurements
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Delete a measurement
    #[command(alias = "rm")]
    Delete {
        /// Measurement ID (device:millis) or capture time in millis
        id: String,
    },
    /// Sync with the remote store
    Sync {
        /// Download-only sync over the background window
        #[arg(long)]
        background: bool,
        /// Also purge uploaded deletions from the remote store
        #[arg(long)]
        purge: bool,
    },
    /// Keep syncing on a timer and on remote changes until interrupted
    Watch {
        /// Seconds between timer-driven syncs
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Show status (device, pending changes, last sync)
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum DeviceCommands {
    /// Show device ID and class
    Show,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_dir, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    let is_write = matches!(
        &cli.command,
        Commands::Record { .. } | Commands::Delete { .. }
    );

    let result = match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Init { companion } => commands::init::init(&config, companion, &output),
        Commands::Device { command } => handle_device_command(command, &config, &output),
        Commands::Record {
            stress,
            hrv,
            rhr,
            confidence,
            at,
        } => commands::record::record(&config, stress, hrv, rhr, confidence, at, &output).await,
        Commands::List { all, limit } => commands::record::list(&config, all, limit, &output).await,
        Commands::Delete { id } => commands::record::delete(&config, id, &output).await,
        Commands::Sync { background, purge } => {
            commands::sync::sync(&config, background, purge, &output).await
        }
        Commands::Watch { interval } => commands::sync::watch(&config, interval, &output).await,
        Commands::Status => commands::status::show(&config, &output).await,
    };

    // Push local writes right away when sync is set up
    if is_write && result.is_ok() {
        commands::sync::auto_sync(&config).await;
    }

    result
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

fn handle_device_command(
    command: Option<DeviceCommands>,
    config: &Config,
    output: &Output,
) -> Result<()> {
    match command {
        Some(DeviceCommands::Show) | None => commands::init::show_device(config, output),
    }
}

/// Set up tracing from SERENE_LOG (default "warn")
///
/// Logs go to `log_file` when configured, otherwise to stderr.
fn init_logging(config: &Config) {
    let log_level = std::env::var("SERENE_LOG").unwrap_or_else(|_| "warn".to_string());
    let env_filter = EnvFilter::new(format!("serene_core={},serene={}", log_level, log_level));

    if let Some(ref log_path) = config.log_file {
        let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
                return;
            }
        };

        // Ignore error if already initialized
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(log_file))
            .try_init();

        info!("Logging initialized to {:?}", log_path);
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .try_init();
    }
}
