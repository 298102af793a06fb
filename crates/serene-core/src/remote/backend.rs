//! Record backend abstraction
//!
//! The lowest layer of the remote stack: a generic record database with
//! predicate queries, server-side subscriptions and push notifications.
//! [`CloudClient`](super::CloudClient) builds the measurement-level
//! contract on top of any implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::error::RemoteResult;
use super::record::RemoteRecord;
use crate::models::RecordKey;

/// Availability of the account backing the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Available,
    NoAccount,
    Restricted,
    Unknown,
}

/// Kind of change a subscription fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Silent push notification delivered when a subscribed record type changes
///
/// Carries no record data; receipt only means "fetch again".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub subscription_id: String,
    pub record_type: String,
    pub kind: ChangeKind,
}

/// A server-side push trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub record_type: String,
    pub fires_on: Vec<ChangeKind>,
    /// Content-available notification without alert
    pub silent: bool,
}

impl Subscription {
    pub fn fires_on(&self, kind: ChangeKind) -> bool {
        self.fires_on.contains(&kind)
    }
}

/// Record query predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub record_type: String,
    /// Only records whose `timestamp` field is at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Skip records whose `isDeleted` field is true
    pub exclude_deleted: bool,
    /// Only records with this logical identity
    pub key: Option<RecordKey>,
}

impl Query {
    pub fn all(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            since: None,
            exclude_deleted: false,
            key: None,
        }
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn live_only(mut self) -> Self {
        self.exclude_deleted = true;
        self
    }

    pub fn with_key(mut self, key: RecordKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// A generic record database
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Upsert records, returning them as stored (with server mod time)
    async fn save_records(&self, records: Vec<RemoteRecord>) -> RemoteResult<Vec<RemoteRecord>>;

    /// Run a query; result order is unspecified
    async fn query(&self, query: &Query) -> RemoteResult<Vec<RemoteRecord>>;

    /// Fetch one record by type and name
    async fn fetch_record(
        &self,
        record_type: &str,
        record_name: &str,
    ) -> RemoteResult<Option<RemoteRecord>>;

    /// Delete records by name, returning how many existed
    async fn delete_records(&self, record_type: &str, names: &[String]) -> RemoteResult<usize>;

    /// Register a push trigger
    ///
    /// Fails with [`RemoteError::Duplicate`](super::RemoteError::Duplicate)
    /// when a subscription with the same id already exists.
    async fn save_subscription(&self, subscription: &Subscription) -> RemoteResult<()>;

    async fn account_status(&self) -> RemoteResult<AccountStatus>;

    /// Stream of push notifications for registered subscriptions
    fn notifications(&self) -> broadcast::Receiver<ChangeNotification>;
}
