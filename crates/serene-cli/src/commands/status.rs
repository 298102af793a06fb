//! Status command handler

use anyhow::Result;

use serene_core::sync::SyncCursor;
use serene_core::{Config, FileStore, LocalStore};

use crate::commands::require_identity;
use crate::output::{Output, OutputFormat};

/// Show status information
pub async fn show(config: &Config, output: &Output) -> Result<()> {
    let identity = require_identity(config)?;
    let store = FileStore::open(config.store_path())?;
    let cursor = SyncCursor::with_path(config.sync_cursor_path())?;

    let live = store.len().await?;
    let pending = store.pending_count().await?;
    let baseline = store.baseline().await?;
    let last_sync = cursor.last_sync_date();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "device_id": identity.id(),
                    "device_class": identity.class().as_str(),
                    "sync_enabled": config.sync_enabled,
                    "remote_dir": config.remote_dir,
                    "conflict_strategy": config.conflict_strategy.as_str(),
                    "last_sync_date": last_sync,
                    "counts": {
                        "measurements": live,
                        "pending": pending
                    },
                    "baseline": baseline
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", pending);
        }
        OutputFormat::Human => {
            println!("Serene Status");
            println!("=============");
            println!();
            println!("Device:");
            println!("  ID:    {}", identity);
            println!("  Class: {}", identity.class());
            println!();
            println!("Sync:");
            println!(
                "  Status:    {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref dir) = config.remote_dir {
                println!("  Remote:    {}", dir.display());
            }
            println!("  Strategy:  {}", config.conflict_strategy);
            println!(
                "  Last sync: {}",
                last_sync
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Contents:");
            println!("  Measurements: {}", live);
            println!("  Pending:      {}", pending);
            if let Some(baseline) = baseline {
                println!(
                    "  Baseline:     rhr {:.0} bpm, hrv {:.1} ms",
                    baseline.resting_heart_rate, baseline.baseline_hrv
                );
            }
        }
    }

    Ok(())
}
