//! Sync state
//!
//! Observable state of the sync pipeline plus the persisted cursor that
//! bounds incremental fetches between sessions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persist::{read_json, write_json};

/// Observable status for UI subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Syncing { progress: f64 },
    Success,
    Error(String),
}

/// Position of the engine in its state machine
///
/// `Idle → Uploading → Downloading → Idle` on success,
/// `Idle → Uploading { retrying } → Failed → Idle` when retries run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Uploading {
        retrying: bool,
    },
    Downloading {
        retrying: bool,
    },
    Failed,
}

/// Snapshot of the current sync attempt
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncState {
    /// Progress of the current attempt in [0, 1]
    pub progress: f64,
    pub is_syncing: bool,
    pub phase: SyncPhase,
    pub last_error: Option<String>,
    /// Start time of the last successful sync (the fetch cursor)
    pub last_sync_date: Option<DateTime<Utc>>,
    /// Completion time of the last remote operation of any kind
    pub last_remote_activity: Option<DateTime<Utc>>,
}

/// Events emitted while syncing
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    PhaseChanged(SyncPhase),
    /// Overall progress after a batch or phase completes
    Progress(f64),
    /// A batch of uploads committed remotely
    BatchCommitted { index: usize, total: usize, size: usize },
    /// An operation failed transiently and will be retried
    Retrying { attempt: u32, delay_ms: u64, error: String },
    /// Remote data changed (push notification)
    RemoteChanged,
}

/// Persisted fetch cursor
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    last_sync_date: Option<DateTime<Utc>>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl SyncCursor {
    /// Create an in-memory cursor
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cursor that persists to disk, loading any saved value
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let stored: Option<SyncCursor> =
            read_json(&path).context("Failed to read sync cursor")?;
        let mut cursor = stored.unwrap_or_default();
        cursor.path = Some(path);
        Ok(cursor)
    }

    pub fn last_sync_date(&self) -> Option<DateTime<Utc>> {
        self.last_sync_date
    }

    /// Advance the cursor and persist it
    ///
    /// The cursor never moves backwards.
    pub fn advance(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.last_sync_date.map_or(true, |last| at > last) {
            self.last_sync_date = Some(at);
        }
        self.save()
    }

    /// Save cursor to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        write_json(path, self).context("Failed to save sync cursor")
    }

    /// Forget the cursor so the next fetch is a full one
    pub fn clear(&mut self) -> Result<()> {
        self.last_sync_date = None;
        self.save()
    }
}
