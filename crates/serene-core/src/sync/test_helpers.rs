//! Scripted remote client for engine and coordinator tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::broadcast;

use crate::models::{Baseline, Measurement, RecordKey};
use crate::remote::{
    AccountStatus, ChangeKind, ChangeNotification, RemoteClient, RemoteError, RemoteResult,
};

/// Fixed capture time used by test fixtures
pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// `count` measurements one minute apart starting at [`t0`]
pub(crate) fn series(device_id: &str, count: usize) -> Vec<Measurement> {
    (0..count)
        .map(|i| {
            Measurement::at(
                t0() + Duration::minutes(i as i64),
                device_id,
                10.0 + i as f64,
                50.0,
                60.0,
            )
        })
        .collect()
}

/// In-memory [`RemoteClient`] whose failures are scripted per call
///
/// Each `save`/`save_batch` call pops one entry from the save script and
/// each `fetch` one entry from the fetch script; `Some(err)` fails the
/// call, `None` or an empty script lets it through.
pub(crate) struct ScriptedClient {
    records: Mutex<BTreeMap<RecordKey, Measurement>>,
    baseline: Mutex<Option<Baseline>>,
    save_script: Mutex<VecDeque<Option<RemoteError>>>,
    fetch_script: Mutex<VecDeque<Option<RemoteError>>>,
    batch_sizes: Mutex<Vec<usize>>,
    fetch_sinces: Mutex<Vec<Option<DateTime<Utc>>>>,
    network_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    lookups: AtomicUsize,
    stamp: AtomicI64,
    notify_tx: broadcast::Sender<ChangeNotification>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(16);
        Self {
            records: Mutex::new(BTreeMap::new()),
            baseline: Mutex::new(None),
            save_script: Mutex::new(VecDeque::new()),
            fetch_script: Mutex::new(VecDeque::new()),
            batch_sizes: Mutex::new(Vec::new()),
            fetch_sinces: Mutex::new(Vec::new()),
            network_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            stamp: AtomicI64::new(0),
            notify_tx,
        }
    }

    pub(crate) fn script_saves(&self, outcomes: impl IntoIterator<Item = Option<RemoteError>>) {
        self.save_script.lock().unwrap().extend(outcomes);
    }

    pub(crate) fn script_fetches(&self, outcomes: impl IntoIterator<Item = Option<RemoteError>>) {
        self.fetch_script.lock().unwrap().extend(outcomes);
    }

    /// Place records remotely without counting a network call
    pub(crate) fn seed(&self, records: impl IntoIterator<Item = Measurement>) {
        let mut stored = self.records.lock().unwrap();
        for mut record in records {
            record.remote_modified_at = Some(self.next_stamp());
            stored.insert(record.key(), record);
        }
    }

    pub(crate) fn seed_baseline(&self, baseline: Baseline) {
        *self.baseline.lock().unwrap() = Some(baseline);
    }

    pub(crate) fn remote(&self, key: &RecordKey) -> Option<Measurement> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn remote_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub(crate) fn remote_baseline(&self) -> Option<Baseline> {
        self.baseline.lock().unwrap().clone()
    }

    /// Sizes of the save calls that succeeded, in order
    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub(crate) fn fetch_sinces(&self) -> Vec<Option<DateTime<Utc>>> {
        self.fetch_sinces.lock().unwrap().clone()
    }

    pub(crate) fn network_calls(&self) -> usize {
        self.network_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Single-record lookups issued through `fetch_one`
    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Deliver a push notification to subscribers
    pub(crate) fn push(&self, kind: ChangeKind) {
        let _ = self.notify_tx.send(ChangeNotification {
            subscription_id: "test".to_string(),
            record_type: "StressMeasurement".to_string(),
            kind,
        });
    }

    fn next_stamp(&self) -> DateTime<Utc> {
        let n = self.stamp.fetch_add(1, Ordering::SeqCst) + 1;
        t0() + Duration::days(1) + Duration::seconds(n)
    }

    fn scripted(script: &Mutex<VecDeque<Option<RemoteError>>>) -> RemoteResult<()> {
        match script.lock().unwrap().pop_front().flatten() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteClient for ScriptedClient {
    async fn save(&self, record: &Measurement) -> RemoteResult<Measurement> {
        let mut saved = self.save_batch(std::slice::from_ref(record)).await?;
        Ok(saved.remove(0))
    }

    async fn save_batch(&self, records: &[Measurement]) -> RemoteResult<Vec<Measurement>> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        Self::scripted(&self.save_script)?;

        let mut stored = self.records.lock().unwrap();
        let mut saved = Vec::with_capacity(records.len());
        for record in records {
            let mut record = record.clone();
            record.remote_modified_at = Some(self.next_stamp());
            stored.insert(record.key(), record.clone());
            saved.push(record);
        }
        self.batch_sizes.lock().unwrap().push(records.len());
        Ok(saved)
    }

    async fn fetch(&self, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Measurement>> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_sinces.lock().unwrap().push(since);
        Self::scripted(&self.fetch_script)?;

        let mut fetched: Vec<Measurement> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|m| !m.is_deleted)
            .filter(|m| since.map_or(true, |s| m.timestamp >= s))
            .cloned()
            .collect();
        fetched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(fetched)
    }

    async fn fetch_one(&self, key: &RecordKey) -> RemoteResult<Option<Measurement>> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.remote(key))
    }

    async fn delete(&self, record: &Measurement) -> RemoteResult<()> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().remove(&record.key());
        Ok(())
    }

    async fn subscribe_to_changes(&self) -> RemoteResult<()> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_availability(&self) -> RemoteResult<AccountStatus> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccountStatus::Available)
    }

    async fn save_baseline(&self, baseline: &Baseline) -> RemoteResult<()> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        *self.baseline.lock().unwrap() = Some(baseline.clone());
        Ok(())
    }

    async fn fetch_baseline(&self) -> RemoteResult<Option<Baseline>> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.baseline.lock().unwrap().clone())
    }

    fn notifications(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notify_tx.subscribe()
    }
}
