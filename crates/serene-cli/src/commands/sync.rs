//! Sync command handlers

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use serene_core::sync::{
    BaselineAction, ConflictStrategy, SyncCursor, SyncEvent, SyncOutcome, SyncPolicy, SyncSession,
    SyncStatus, SyncSummary,
};
use serene_core::remote::AccountStatus;
use serene_core::{CloudClient, Config, FileStore, MemoryBackend, RemoteClient, SyncCoordinator};

use crate::commands::require_identity;
use crate::output::{Output, OutputFormat};

type Coordinator = SyncCoordinator<CloudClient<MemoryBackend>, FileStore>;

/// Sync once with the remote store
pub async fn sync(config: &Config, background: bool, purge: bool, output: &Output) -> Result<()> {
    ensure_sync_configured(config)?;
    let coordinator = build_coordinator(config)?;
    let cancel = cancel_on_ctrl_c();

    let account = coordinator
        .engine()
        .client()
        .check_availability()
        .await
        .context("Failed to check remote account")?;
    if account != AccountStatus::Available {
        bail!("Remote account unavailable ({:?})", account);
    }

    output.message("Syncing with remote store...");

    let outcome = if background {
        coordinator.background_sync(&cancel).await
    } else {
        coordinator.sync_user_initiated(&cancel).await
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            output.message(&format!("Sync failed: {}", e));
            return Err(e.into());
        }
    };

    let summary = match outcome {
        SyncOutcome::Completed(summary) => summary,
        SyncOutcome::Cancelled => {
            output.message("Sync cancelled - unsent changes stay queued");
            return Ok(());
        }
        SyncOutcome::Throttled { next_allowed_at } => {
            let when = next_allowed_at
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "later".to_string());
            output.message(&format!("Sync skipped - next attempt allowed at {}", when));
            return Ok(());
        }
    };

    let purged = if purge {
        coordinator
            .purge_tombstones(&cancel)
            .await
            .context("Failed to purge deleted measurements")?
    } else {
        0
    };

    print_summary(&summary, purged, output);
    Ok(())
}

/// Sync on a timer and on remote changes until Ctrl-C
pub async fn watch(config: &Config, interval: u64, output: &Output) -> Result<()> {
    ensure_sync_configured(config)?;
    let coordinator = build_coordinator(config)?;
    let cancel = cancel_on_ctrl_c();

    let printer = if matches!(output.format, OutputFormat::Human) {
        let events = coordinator.session().subscribe_events();
        Some(tokio::spawn(print_events(events)))
    } else {
        None
    };

    output.message(&format!(
        "Watching for changes every {}s (Ctrl-C to stop)...",
        interval.max(1)
    ));
    coordinator
        .run(cancel, Duration::from_secs(interval.max(1)))
        .await;

    if let Some(printer) = printer {
        printer.abort();
    }
    output.success("Stopped watching");
    Ok(())
}

/// Sync quietly after a local write - failures are only logged
pub async fn auto_sync(config: &Config) {
    if !config.sync_enabled || config.remote_dir.is_none() {
        return;
    }

    let coordinator = match build_coordinator(config) {
        Ok(c) => c,
        Err(e) => {
            warn!("Auto-sync unavailable: {:#}", e);
            return;
        }
    };

    match coordinator.sync(&CancellationToken::new()).await {
        Ok(SyncOutcome::Completed(summary)) => {
            debug!("Auto-sync uploaded {} measurement(s)", summary.uploaded)
        }
        Ok(_) => debug!("Auto-sync skipped"),
        Err(e) => warn!("Auto-sync failed: {}", e),
    }
}

fn ensure_sync_configured(config: &Config) -> Result<()> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             serene config set sync_enabled true\n  \
             serene config set remote_dir /path/to/shared/dir"
        );
    }
    if config.remote_dir.is_none() {
        bail!(
            "Remote store not configured. Set it with:\n  \
             serene config set remote_dir /path/to/shared/dir"
        );
    }
    Ok(())
}

/// Wire the coordinator for this device from configuration
fn build_coordinator(config: &Config) -> Result<Coordinator> {
    let identity = require_identity(config)?;
    let Some(remote_path) = config.remote_records_path() else {
        bail!("Remote store not configured");
    };

    let cursor = SyncCursor::with_path(config.sync_cursor_path())
        .context("Failed to load sync cursor")?;
    let policy = SyncPolicy::for_class(identity.class()).with_overrides(&config.sync);
    let strategy = ConflictStrategy::from_config(
        config.conflict_strategy,
        identity.class(),
        config.priority_device,
    );
    debug!(
        "Sync as {} ({}): batch size {}, strategy {:?}",
        identity,
        identity.class(),
        policy.batch_size,
        strategy
    );

    let session = Arc::new(SyncSession::with_cursor(identity, cursor));
    let backend = Arc::new(
        MemoryBackend::open(&remote_path)
            .with_context(|| format!("Failed to open remote store {:?}", remote_path))?,
    );
    let client = Arc::new(CloudClient::new(
        backend,
        session.clone(),
        policy.subscription.clone(),
    ));
    let store = Arc::new(FileStore::open(config.store_path())?);

    Ok(SyncCoordinator::new(client, session, store, policy, strategy))
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::BatchCommitted { index, total, size }) => {
                println!("  batch {}/{} committed ({} measurement(s))", index + 1, total, size);
            }
            Ok(SyncEvent::Retrying {
                attempt,
                delay_ms,
                error,
            }) => {
                println!(
                    "  {} - retrying (attempt {}) in {:.1}s",
                    error,
                    attempt,
                    delay_ms as f64 / 1000.0
                );
            }
            Ok(SyncEvent::RemoteChanged) => println!("Remote changed, refreshing..."),
            Ok(SyncEvent::StatusChanged(SyncStatus::Success)) => println!("✓ Synced"),
            Ok(SyncEvent::StatusChanged(SyncStatus::Error(e))) => println!("Sync failed: {}", e),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

fn print_summary(summary: &SyncSummary, purged: usize, output: &Output) {
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "success",
                    "summary": summary,
                    "purged": purged
                })
            );
        }
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            output.success("Sync complete");
            if summary.uploaded > 0 {
                println!(
                    "  Uploaded:   {} in {} batch(es)",
                    summary.uploaded,
                    summary.batches.len()
                );
            }
            println!(
                "  Downloaded: {} (applied {}, kept local {}, merged {})",
                summary.downloaded, summary.applied, summary.kept_local, summary.merged
            );
            match summary.baseline {
                BaselineAction::Pulled => println!("  Baseline:   updated from remote"),
                BaselineAction::Pushed => println!("  Baseline:   uploaded"),
                BaselineAction::Unchanged => {}
            }
            if purged > 0 {
                println!("  Purged:     {} deleted measurement(s)", purged);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serene_core::identity::{self, DeviceClass};
    use serene_core::{LocalStore, Measurement};
    use tempfile::TempDir;

    struct Device {
        _data: TempDir,
        config: Config,
        id: String,
    }

    fn device(remote: &TempDir, class: DeviceClass) -> Device {
        let data = TempDir::new().unwrap();
        let config = Config {
            data_dir: data.path().to_path_buf(),
            remote_dir: Some(remote.path().to_path_buf()),
            sync_enabled: true,
            ..Config::default()
        };
        let init = identity::initialize(&config.device_id_path(), class).unwrap();
        Device {
            id: init.identity.id().to_string(),
            _data: data,
            config,
        }
    }

    #[tokio::test]
    async fn test_sync_requires_configuration() {
        let data = TempDir::new().unwrap();
        let config = Config {
            data_dir: data.path().to_path_buf(),
            ..Config::default()
        };
        let output = Output::new(OutputFormat::Quiet);

        let err = sync(&config, false, false, &output).await.unwrap_err();
        assert!(err.to_string().contains("not enabled"));
    }

    #[tokio::test]
    async fn test_phone_and_watch_converge_through_shared_dir() {
        let remote = TempDir::new().unwrap();
        let phone = device(&remote, DeviceClass::Primary);
        let watch = device(&remote, DeviceClass::Companion);
        let output = Output::new(OutputFormat::Quiet);

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let store = FileStore::open(watch.config.store_path()).unwrap();
        store
            .insert(Measurement::at(at, watch.id.clone(), 71.0, 38.0, 68.0))
            .await
            .unwrap();
        drop(store);

        sync(&watch.config, false, false, &output).await.unwrap();
        sync(&phone.config, false, false, &output).await.unwrap();

        let phone_store = FileStore::open(phone.config.store_path()).unwrap();
        let received = phone_store.all(false).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].device_id, watch.id);
        assert!(phone_store.pending_local_changes().await.unwrap().is_empty());

        // The watch's cursor persisted across invocations
        let cursor = SyncCursor::with_path(watch.config.sync_cursor_path()).unwrap();
        assert!(cursor.last_sync_date().is_some());
        assert_ne!(phone.id, watch.id);
    }
}
