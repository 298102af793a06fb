//! Remote client
//!
//! Measurement-level CRUD, query and subscription contract over the cloud
//! backend. One implementation serves every device class; device-specific
//! behavior comes from the [`SubscriptionOptions`] it is built with.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use super::backend::{
    AccountStatus, ChangeKind, ChangeNotification, Query, RecordBackend, Subscription,
};
use super::error::{RemoteError, RemoteResult};
use super::record::{
    decode_baseline, decode_measurement, encode_baseline, encode_measurement, RemoteRecord,
    BASELINE_RECORD_NAME, BASELINE_RECORD_TYPE, MEASUREMENT_RECORD_TYPE,
};
use crate::models::{Baseline, Measurement, RecordKey};
use crate::sync::SyncSession;

/// Push subscription settings for a device class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub subscription_id: String,
    pub fires_on: Vec<ChangeKind>,
    pub silent: bool,
}

impl SubscriptionOptions {
    /// Silent trigger on create, update and delete
    pub fn all_changes(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            fires_on: vec![ChangeKind::Create, ChangeKind::Update, ChangeKind::Delete],
            silent: true,
        }
    }

    fn to_subscription(&self) -> Subscription {
        Subscription {
            id: self.subscription_id.clone(),
            record_type: MEASUREMENT_RECORD_TYPE.to_string(),
            fires_on: self.fires_on.clone(),
            silent: self.silent,
        }
    }
}

/// Contract of the remote measurement store
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Idempotent upsert of one measurement
    ///
    /// Returns the stored version, carrying the server modification time.
    async fn save(&self, record: &Measurement) -> RemoteResult<Measurement>;

    /// Upsert several measurements, returning the stored versions in order
    ///
    /// Backends without multi-record writes fall back to one save per record.
    async fn save_batch(&self, records: &[Measurement]) -> RemoteResult<Vec<Measurement>> {
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            stored.push(self.save(record).await?);
        }
        Ok(stored)
    }

    /// Live measurements with `timestamp >= since` (all when `None`),
    /// newest first
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Measurement>>;

    /// Current remote version of one measurement, tombstoned or not
    async fn fetch_one(&self, key: &RecordKey) -> RemoteResult<Option<Measurement>>;

    /// Delete the remote counterpart of a measurement
    ///
    /// Looked up by logical identity; succeeds when nothing matches.
    async fn delete(&self, record: &Measurement) -> RemoteResult<()>;

    /// Register the push trigger; an existing registration counts as success
    async fn subscribe_to_changes(&self) -> RemoteResult<()>;

    async fn check_availability(&self) -> RemoteResult<AccountStatus>;

    /// Overwrite the account baseline
    async fn save_baseline(&self, baseline: &Baseline) -> RemoteResult<()>;

    async fn fetch_baseline(&self) -> RemoteResult<Option<Baseline>>;

    /// Push notifications for this client's subscription
    fn notifications(&self) -> broadcast::Receiver<ChangeNotification>;
}

/// [`RemoteClient`] over a [`RecordBackend`]
pub struct CloudClient<B: RecordBackend> {
    backend: Arc<B>,
    session: Arc<SyncSession>,
    subscription: SubscriptionOptions,
}

impl<B: RecordBackend> CloudClient<B> {
    pub fn new(backend: Arc<B>, session: Arc<SyncSession>, subscription: SubscriptionOptions) -> Self {
        Self {
            backend,
            session,
            subscription,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Run an operation, reporting it on the session's observable status
    async fn tracked<T, F>(&self, op: &'static str, fut: F) -> RemoteResult<T>
    where
        F: Future<Output = RemoteResult<T>> + Send,
        T: Send,
    {
        self.session.remote_op_started();
        let result = fut.await;
        if let Err(ref e) = result {
            debug!("Remote {} failed: {}", op, e);
        }
        self.session.remote_op_finished(result.as_ref().err());
        result
    }
}

#[async_trait]
impl<B: RecordBackend + 'static> RemoteClient for CloudClient<B> {
    async fn save(&self, record: &Measurement) -> RemoteResult<Measurement> {
        self.tracked("save", async {
            let saved = self
                .backend
                .save_records(vec![encode_measurement(record)])
                .await?;
            match decode_all(&saved)?.pop() {
                Some(stored) => Ok(stored),
                None => Err(RemoteError::Unknown(format!(
                    "Backend returned nothing for {}",
                    record.key()
                ))),
            }
        })
        .await
    }

    async fn save_batch(&self, records: &[Measurement]) -> RemoteResult<Vec<Measurement>> {
        let encoded = records.iter().map(encode_measurement).collect();
        self.tracked("save_batch", async {
            let saved = self.backend.save_records(encoded).await?;
            decode_all(&saved)
        })
        .await
    }

    async fn fetch(&self, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Measurement>> {
        self.tracked("fetch", async {
            let query = Query::all(MEASUREMENT_RECORD_TYPE).since(since).live_only();
            let records = self.backend.query(&query).await?;

            let mut measurements = decode_all(&records)?;
            measurements.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            Ok(measurements)
        })
        .await
    }

    async fn fetch_one(&self, key: &RecordKey) -> RemoteResult<Option<Measurement>> {
        self.tracked("fetch_one", async {
            let query = Query::all(MEASUREMENT_RECORD_TYPE).with_key(key.clone());
            let records = self.backend.query(&query).await?;
            Ok(decode_all(&records)?.into_iter().next())
        })
        .await
    }

    async fn delete(&self, record: &Measurement) -> RemoteResult<()> {
        self.tracked("delete", async {
            let query = Query::all(MEASUREMENT_RECORD_TYPE).with_key(record.key());
            let names: Vec<String> = self
                .backend
                .query(&query)
                .await?
                .into_iter()
                .map(|r| r.record_name)
                .collect();

            if names.is_empty() {
                debug!("No remote record for {}, nothing to delete", record.key());
                return Ok(());
            }

            self.backend
                .delete_records(MEASUREMENT_RECORD_TYPE, &names)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn subscribe_to_changes(&self) -> RemoteResult<()> {
        self.tracked("subscribe", async {
            match self
                .backend
                .save_subscription(&self.subscription.to_subscription())
                .await
            {
                Ok(()) => Ok(()),
                Err(RemoteError::Duplicate(id)) => {
                    debug!("Subscription {} already registered", id);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn check_availability(&self) -> RemoteResult<AccountStatus> {
        self.tracked("check_availability", self.backend.account_status())
            .await
    }

    async fn save_baseline(&self, baseline: &Baseline) -> RemoteResult<()> {
        self.tracked("save_baseline", async {
            self.backend
                .save_records(vec![encode_baseline(baseline)])
                .await
                .map(|_| ())
        })
        .await
    }

    async fn fetch_baseline(&self) -> RemoteResult<Option<Baseline>> {
        self.tracked("fetch_baseline", async {
            match self
                .backend
                .fetch_record(BASELINE_RECORD_TYPE, BASELINE_RECORD_NAME)
                .await?
            {
                Some(record) => Ok(Some(decode_baseline(&record)?)),
                None => Ok(None),
            }
        })
        .await
    }

    fn notifications(&self) -> broadcast::Receiver<ChangeNotification> {
        self.backend.notifications()
    }
}

fn decode_all(records: &[RemoteRecord]) -> RemoteResult<Vec<Measurement>> {
    records
        .iter()
        .map(decode_measurement)
        .collect::<Result<Vec<_>, _>>()
        .map_err(RemoteError::from)
}
