//! In-process record backend
//!
//! Keeps records in memory, optionally mirrored to a JSON file so several
//! device processes pointed at the same directory share one account.
//! The file is re-read before every operation and rewritten after every
//! mutation, all under an exclusive lock on a sibling `.lock` file.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::{
    AccountStatus, ChangeKind, ChangeNotification, Query, RecordBackend, Subscription,
};
use super::error::{RemoteError, RemoteResult};
use super::record::{fields, record_key, FieldValue, RemoteRecord};
use crate::persist::{read_json, write_json};

/// How long an operation waits for another process to release the file
const LOCK_TIMEOUT: StdDuration = StdDuration::from_secs(10);
const LOCK_POLL: StdDuration = StdDuration::from_millis(10);

/// On-disk layout of a shared backend
#[derive(Debug, Default, Serialize, Deserialize)]
struct BackendFile {
    #[serde(default)]
    records: Vec<RemoteRecord>,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by (record type, record name)
    records: BTreeMap<(String, String), RemoteRecord>,
    subscriptions: BTreeMap<String, Subscription>,
    last_stamp: Option<DateTime<Utc>>,
    account: Option<AccountStatus>,
    /// Errors returned by the next operations, in order
    faults: VecDeque<RemoteError>,
}

impl Inner {
    /// Server clock: strictly increasing modification times
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn take_fault(&mut self) -> RemoteResult<()> {
        match self.faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Record backend held in memory
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    notify_tx: broadcast::Sender<ChangeNotification>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty, purely in-memory backend
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(Inner::default()),
            path: None,
            notify_tx,
        }
    }

    /// Open a backend mirrored to a JSON file
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut inner = Inner::default();
        load_file(&path, &mut inner)?;

        let (notify_tx, _) = broadcast::channel(64);
        Ok(Self {
            inner: Mutex::new(inner),
            path: Some(path),
            notify_tx,
        })
    }

    /// Override the reported account status
    pub async fn set_account_status(&self, status: AccountStatus) {
        self.inner.lock().await.account = Some(status);
    }

    /// Make the next operation fail with `err`
    ///
    /// Queued faults are consumed one per operation, in order.
    pub async fn fail_next(&self, err: RemoteError) {
        self.inner.lock().await.faults.push_back(err);
    }

    /// Number of stored records of every type
    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }

    /// Snapshot of all stored records
    pub async fn records(&self) -> Vec<RemoteRecord> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    /// Start an operation: take the in-process lock, consume a queued
    /// fault, then lock and re-read the shared file
    ///
    /// The file lock is held until the returned guard drops, so a
    /// read-modify-write never interleaves with another process.
    async fn begin(&self) -> RemoteResult<(MutexGuard<'_, Inner>, Option<FileLock>)> {
        let mut inner = self.inner.lock().await;
        inner.take_fault()?;

        let Some(ref path) = self.path else {
            return Ok((inner, None));
        };
        let lock = FileLock::acquire(&path.with_extension("lock")).await?;
        inner.records.clear();
        inner.subscriptions.clear();
        load_file(path, &mut inner).map_err(|e| RemoteError::Unknown(e.to_string()))?;
        Ok((inner, Some(lock)))
    }

    fn persist(&self, inner: &Inner) -> RemoteResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let file = BackendFile {
            records: inner.records.values().cloned().collect(),
            subscriptions: inner.subscriptions.values().cloned().collect(),
        };
        write_json(path, &file).map_err(|e| RemoteError::Unknown(e.to_string()))
    }

    fn notify(&self, inner: &Inner, record_type: &str, kind: ChangeKind) {
        for sub in inner.subscriptions.values() {
            if sub.record_type == record_type && sub.fires_on(kind) {
                // No receivers is fine: nobody is listening for pushes
                let _ = self.notify_tx.send(ChangeNotification {
                    subscription_id: sub.id.clone(),
                    record_type: record_type.to_string(),
                    kind,
                });
            }
        }
    }
}

/// Exclusive advisory lock on a file, released on drop
struct FileLock {
    file: File,
}

impl FileLock {
    async fn acquire(path: &Path) -> RemoteResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| RemoteError::Unknown(format!("Failed to open {:?}: {}", path, e)))?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if Instant::now() >= deadline => {
                    return Err(RemoteError::Unknown(format!(
                        "Timed out waiting for {:?}: {}",
                        path, e
                    )));
                }
                Err(_) => tokio::time::sleep(LOCK_POLL).await,
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release backend lock: {}", e);
        }
    }
}

fn load_file(path: &Path, inner: &mut Inner) -> anyhow::Result<()> {
    let Some(file) = read_json::<BackendFile>(path)? else {
        return Ok(());
    };

    for record in file.records {
        if let Some(at) = record.modified_at {
            if inner.last_stamp.map_or(true, |last| at > last) {
                inner.last_stamp = Some(at);
            }
        }
        inner.records.insert(
            (record.record_type.clone(), record.record_name.clone()),
            record,
        );
    }
    for sub in file.subscriptions {
        inner.subscriptions.insert(sub.id.clone(), sub);
    }
    Ok(())
}

fn query_matches(query: &Query, record: &RemoteRecord) -> bool {
    if record.record_type != query.record_type {
        return false;
    }

    if query.exclude_deleted
        && matches!(record.get(fields::IS_DELETED), Some(FieldValue::Bool(true)))
    {
        return false;
    }

    if let Some(since) = query.since {
        match record.get(fields::TIMESTAMP) {
            Some(FieldValue::Date(ts)) if *ts >= since => {}
            _ => return false,
        }
    }

    if let Some(ref key) = query.key {
        match record_key(record) {
            Ok(ref k) if k == key => {}
            _ => return false,
        }
    }

    true
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn save_records(&self, records: Vec<RemoteRecord>) -> RemoteResult<Vec<RemoteRecord>> {
        let (mut inner, _file_lock) = self.begin().await?;

        let mut saved = Vec::with_capacity(records.len());
        let mut kinds = Vec::with_capacity(records.len());
        for mut record in records {
            let key = (record.record_type.clone(), record.record_name.clone());
            let kind = if inner.records.contains_key(&key) {
                ChangeKind::Update
            } else {
                ChangeKind::Create
            };
            let stamp = inner.next_stamp();
            record.stamp(stamp);
            inner.records.insert(key, record.clone());
            kinds.push((record.record_type.clone(), kind));
            saved.push(record);
        }

        self.persist(&inner)?;
        for (record_type, kind) in kinds {
            self.notify(&inner, &record_type, kind);
        }
        debug!("Backend stored {} record(s)", saved.len());
        Ok(saved)
    }

    async fn query(&self, query: &Query) -> RemoteResult<Vec<RemoteRecord>> {
        let (inner, _file_lock) = self.begin().await?;

        Ok(inner
            .records
            .values()
            .filter(|r| query_matches(query, r))
            .cloned()
            .collect())
    }

    async fn fetch_record(
        &self,
        record_type: &str,
        record_name: &str,
    ) -> RemoteResult<Option<RemoteRecord>> {
        let (inner, _file_lock) = self.begin().await?;

        Ok(inner
            .records
            .get(&(record_type.to_string(), record_name.to_string()))
            .cloned())
    }

    async fn delete_records(&self, record_type: &str, names: &[String]) -> RemoteResult<usize> {
        let (mut inner, _file_lock) = self.begin().await?;

        let mut removed = 0;
        for name in names {
            if inner
                .records
                .remove(&(record_type.to_string(), name.clone()))
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            self.persist(&inner)?;
            self.notify(&inner, record_type, ChangeKind::Delete);
        }
        Ok(removed)
    }

    async fn save_subscription(&self, subscription: &Subscription) -> RemoteResult<()> {
        let (mut inner, _file_lock) = self.begin().await?;

        if inner.subscriptions.contains_key(&subscription.id) {
            return Err(RemoteError::Duplicate(subscription.id.clone()));
        }
        inner
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        if let Err(e) = self.persist(&inner) {
            warn!("Failed to persist subscription {}: {}", subscription.id, e);
            return Err(e);
        }
        Ok(())
    }

    async fn account_status(&self) -> RemoteResult<AccountStatus> {
        let mut inner = self.inner.lock().await;
        inner.take_fault()?;
        Ok(inner.account.unwrap_or(AccountStatus::Available))
    }

    fn notifications(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notify_tx.subscribe()
    }
}
