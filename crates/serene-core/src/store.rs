//! Local measurement store
//!
//! The sync layer talks to local persistence through [`LocalStore`]:
//! it pulls pending changes before an upload and pushes resolved remote
//! versions back after a download. Local storage stays authoritative for
//! the current session whatever the sync state.
//!
//! [`FileStore`] keeps everything in one JSON file and is what the CLI uses.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::models::{Baseline, Measurement, RecordKey};
use crate::persist::{read_json, write_json};

/// Local persistence as seen by the sync layer
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Records created, changed or tombstoned since they were last synced
    async fn pending_local_changes(&self) -> Result<Vec<Measurement>>;

    /// Store remote versions verbatim, marking them synced
    async fn apply_remote_changes(&self, records: Vec<Measurement>) -> Result<()>;

    /// Write a record locally and queue it for upload
    async fn upsert(&self, record: Measurement) -> Result<()>;

    async fn find(&self, key: &RecordKey) -> Result<Option<Measurement>>;

    /// Record a successful upload of the given stored versions
    ///
    /// Adopts their server modification time and clears the pending flag,
    /// unless the local copy was edited again in the meantime.
    async fn mark_synced(&self, uploaded: &[Measurement]) -> Result<()>;

    /// Tombstones whose deletion has already been uploaded
    async fn synced_tombstones(&self) -> Result<Vec<Measurement>>;

    /// Physically drop records (after their tombstones were purged remotely)
    async fn remove(&self, keys: &[RecordKey]) -> Result<()>;

    async fn baseline(&self) -> Result<Option<Baseline>>;

    async fn apply_baseline(&self, baseline: Baseline) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMeasurement {
    #[serde(flatten)]
    measurement: Measurement,
    #[serde(default)]
    pending: bool,
}

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    measurements: Vec<StoredMeasurement>,
    #[serde(default)]
    baseline: Option<Baseline>,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RecordKey, StoredMeasurement>,
    baseline: Option<Baseline>,
}

impl Inner {
    fn from_file(file: StoreFile) -> Self {
        let records = file
            .measurements
            .into_iter()
            .map(|stored| (stored.measurement.key(), stored))
            .collect();
        Self {
            records,
            baseline: file.baseline,
        }
    }

    fn to_file(&self) -> StoreFile {
        StoreFile {
            measurements: self.records.values().cloned().collect(),
            baseline: self.baseline.clone(),
        }
    }
}

/// JSON-file backed [`LocalStore`]
///
/// The file is re-read at the start of every operation so a long-running
/// sync loop and one-shot commands can share it.
pub struct FileStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open (or start) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = load(&path)?;
        debug!(
            "Opened store {:?} with {} measurement(s)",
            path,
            inner.records.len()
        );

        Ok(Self {
            path: Some(path),
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a new local measurement
    pub async fn insert(&self, measurement: Measurement) -> Result<()> {
        self.upsert(measurement).await
    }

    /// Tombstone a measurement and queue the deletion for upload
    ///
    /// Returns false when no such measurement exists.
    pub async fn tombstone(&self, key: &RecordKey) -> Result<bool> {
        let mut inner = self.lock().await?;
        let Some(stored) = inner.records.get_mut(key) else {
            return Ok(false);
        };
        stored.measurement.tombstone();
        stored.pending = true;
        self.persist(&inner)?;
        Ok(true)
    }

    /// All measurements, newest first
    pub async fn all(&self, include_deleted: bool) -> Result<Vec<Measurement>> {
        let inner = self.lock().await?;
        Ok(inner
            .records
            .values()
            .rev()
            .filter(|s| include_deleted || !s.measurement.is_deleted)
            .map(|s| s.measurement.clone())
            .collect())
    }

    /// Number of live measurements
    pub async fn len(&self) -> Result<usize> {
        let inner = self.lock().await?;
        Ok(inner
            .records
            .values()
            .filter(|s| !s.measurement.is_deleted)
            .count())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let inner = self.lock().await?;
        Ok(inner.records.values().filter(|s| s.pending).count())
    }

    /// Lock the state, picking up writes made by other processes
    async fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().await;
        if let Some(ref path) = self.path {
            *inner = load(path)?;
        }
        Ok(inner)
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        write_json(path, &inner.to_file()).context("Failed to save measurement store")
    }
}

fn load(path: &Path) -> Result<Inner> {
    let file: StoreFile = read_json(path)
        .with_context(|| format!("Failed to open measurement store {:?}", path))?
        .unwrap_or_default();
    Ok(Inner::from_file(file))
}

#[async_trait]
impl LocalStore for FileStore {
    async fn pending_local_changes(&self) -> Result<Vec<Measurement>> {
        let inner = self.lock().await?;
        Ok(inner
            .records
            .values()
            .filter(|s| s.pending)
            .map(|s| s.measurement.clone())
            .collect())
    }

    async fn apply_remote_changes(&self, records: Vec<Measurement>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock().await?;
        for measurement in records {
            inner.records.insert(
                measurement.key(),
                StoredMeasurement {
                    measurement,
                    pending: false,
                },
            );
        }
        self.persist(&inner)
    }

    async fn upsert(&self, record: Measurement) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.records.insert(
            record.key(),
            StoredMeasurement {
                measurement: record,
                pending: true,
            },
        );
        self.persist(&inner)
    }

    async fn find(&self, key: &RecordKey) -> Result<Option<Measurement>> {
        let inner = self.lock().await?;
        Ok(inner.records.get(key).map(|s| s.measurement.clone()))
    }

    async fn mark_synced(&self, uploaded: &[Measurement]) -> Result<()> {
        let mut inner = self.lock().await?;
        let mut changed = false;
        for remote in uploaded {
            let Some(stored) = inner.records.get_mut(&remote.key()) else {
                continue;
            };
            if !stored.measurement.same_payload(remote) {
                debug!("{} changed during upload, keeping it pending", remote.key());
                continue;
            }
            changed |= stored.pending
                || stored.measurement.remote_modified_at != remote.remote_modified_at;
            stored.measurement.remote_modified_at = remote.remote_modified_at;
            stored.pending = false;
        }
        if changed {
            self.persist(&inner)?;
        }
        Ok(())
    }

    async fn synced_tombstones(&self) -> Result<Vec<Measurement>> {
        let inner = self.lock().await?;
        Ok(inner
            .records
            .values()
            .filter(|s| s.measurement.is_deleted && !s.pending)
            .map(|s| s.measurement.clone())
            .collect())
    }

    async fn remove(&self, keys: &[RecordKey]) -> Result<()> {
        let mut inner = self.lock().await?;
        let before = inner.records.len();
        for key in keys {
            inner.records.remove(key);
        }
        if inner.records.len() != before {
            self.persist(&inner)?;
        }
        Ok(())
    }

    async fn baseline(&self) -> Result<Option<Baseline>> {
        Ok(self.lock().await?.baseline.clone())
    }

    async fn apply_baseline(&self, baseline: Baseline) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.baseline = Some(baseline);
        self.persist(&inner)
    }
}
