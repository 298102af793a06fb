//! Sync coordinator
//!
//! Wires the engine to the local store, the throttle and the conflict
//! resolver for one device:
//!
//! 1. Pull pending local changes from the store
//! 2. Check edits of synced records against their current remote version
//! 3. Upload and download through the engine
//! 4. Mark committed batches synced
//! 5. Resolve every downloaded record against its local version, then
//!    commit the fetch cursor
//! 6. Reconcile the account baseline
//!
//! Timer and push triggered syncs pass through the throttle; explicit user
//! syncs do not.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::{resolve, ConflictStrategy, MergeDecision};
use super::engine::{SyncEngine, SyncError, SyncOutcome};
use super::policy::SyncPolicy;
use super::retry::with_backoff;
use super::session::SyncSession;
use super::state::{SyncEvent, SyncPhase};
use super::throttle::ThrottleController;
use crate::models::{Baseline, Measurement};
use crate::remote::RemoteClient;
use crate::store::LocalStore;

/// What happened to the account baseline during a sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineAction {
    #[default]
    Unchanged,
    /// Remote was newer and replaced the local copy
    Pulled,
    /// Local was newer and was uploaded
    Pushed,
}

/// Summary of one coordinated sync
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub batches: Vec<usize>,
    pub downloaded: usize,
    /// Remote versions written locally
    pub applied: usize,
    /// Conflicts where the local version won and was queued for upload
    pub kept_local: usize,
    /// Conflicts resolved by unioning additive fields
    pub merged: usize,
    pub baseline: BaselineAction,
}

#[derive(Debug, Default)]
struct Reconciled {
    applied: usize,
    kept_local: usize,
    merged: usize,
}

pub struct SyncCoordinator<C: ?Sized, S: ?Sized> {
    engine: SyncEngine<C>,
    store: Arc<S>,
    throttle: Mutex<ThrottleController>,
    strategy: ConflictStrategy,
}

impl<C, S> SyncCoordinator<C, S>
where
    C: RemoteClient + ?Sized,
    S: LocalStore + ?Sized,
{
    pub fn new(
        client: Arc<C>,
        session: Arc<SyncSession>,
        store: Arc<S>,
        policy: SyncPolicy,
        strategy: ConflictStrategy,
    ) -> Self {
        let throttle = ThrottleController::new(policy.throttle_interval);
        Self {
            engine: SyncEngine::new(client, session, policy),
            store,
            throttle: Mutex::new(throttle),
            strategy,
        }
    }

    pub fn engine(&self) -> &SyncEngine<C> {
        &self.engine
    }

    pub fn session(&self) -> &Arc<SyncSession> {
        self.engine.session()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub async fn should_sync_now(&self) -> bool {
        self.throttle.lock().await.should_sync_now()
    }

    /// Automatic (timer) sync, subject to the throttle
    pub async fn sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<SyncSummary>, SyncError> {
        if let Some(throttled) = self.admit().await {
            return Ok(throttled);
        }
        self.run_sync(cancel).await
    }

    /// Explicit user sync; never throttled but still counts as an attempt
    pub async fn sync_user_initiated(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<SyncSummary>, SyncError> {
        self.throttle.lock().await.record_attempt(Utc::now());
        self.run_sync(cancel).await
    }

    /// Push-triggered refresh: download since the cursor, subject to the
    /// throttle
    pub async fn refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<SyncSummary>, SyncError> {
        if let Some(throttled) = self.admit().await {
            return Ok(throttled);
        }
        self.run_download(self.session().last_sync_date(), cancel)
            .await
    }

    /// Download-only sync for OS background execution windows
    pub async fn background_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<SyncSummary>, SyncError> {
        self.throttle.lock().await.record_attempt(Utc::now());
        self.run_download(Some(self.engine.background_since()), cancel)
            .await
    }

    /// Purge already-uploaded tombstones remotely, then drop them locally
    pub async fn purge_tombstones(&self, cancel: &CancellationToken) -> Result<usize, SyncError> {
        let _permit = self.engine.acquire()?;
        let tombstones = self.store.synced_tombstones().await.map_err(store_error)?;
        if tombstones.is_empty() {
            return Ok(0);
        }

        let purged = self.engine.purge(&tombstones, cancel).await?;
        let keys: Vec<_> = tombstones.iter().map(Measurement::key).collect();
        self.store.remove(&keys).await.map_err(store_error)?;
        Ok(purged)
    }

    /// React to timer ticks and push notifications until cancelled
    ///
    /// Registers the push subscription first. Individual sync failures are
    /// logged and reflected in the session; the loop keeps running.
    pub async fn run(&self, cancel: CancellationToken, interval: Duration) {
        let mut notifications = self.engine.client().notifications();
        let mut push_open = true;

        let subscribed = with_backoff(
            &self.engine.policy().retry,
            &cancel,
            "subscribe",
            || self.engine.client().subscribe_to_changes(),
            |_, _, _| {},
        )
        .await;
        match subscribed {
            Ok(()) => info!("Subscribed to remote changes"),
            Err(SyncError::Cancelled) => return,
            Err(e) => warn!("Push subscription failed, relying on timer: {}", e),
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Sync loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    log_result("timer", self.sync(&cancel).await);
                }
                received = notifications.recv(), if push_open => {
                    match received {
                        Ok(note) => {
                            debug!("Push notification: {:?} {}", note.kind, note.record_type);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            debug!("Missed {} push notification(s)", missed);
                        }
                        Err(RecvError::Closed) => {
                            warn!("Push channel closed, relying on timer");
                            push_open = false;
                            continue;
                        }
                    }
                    self.session().emit(SyncEvent::RemoteChanged);
                    log_result("push", self.refresh(&cancel).await);
                }
            }
        }
    }

    /// Consult the throttle; `Some` means the attempt is skipped
    async fn admit(&self) -> Option<SyncOutcome<SyncSummary>> {
        let mut throttle = self.throttle.lock().await;
        let now = Utc::now();
        if !throttle.should_sync_at(now) {
            let next_allowed_at = throttle.next_allowed_at();
            debug!("Sync throttled until {:?}", next_allowed_at);
            return Some(SyncOutcome::Throttled { next_allowed_at });
        }
        throttle.record_attempt(now);
        None
    }

    /// One full attempt, holding the engine from start to finish
    async fn run_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<SyncSummary>, SyncError> {
        let _permit = self.engine.acquire()?;
        self.session()
            .begin(SyncPhase::Uploading { retrying: false });
        let result = self.attempt_sync(cancel).await;
        self.engine.conclude(result)
    }

    async fn attempt_sync(&self, cancel: &CancellationToken) -> Result<SyncSummary, SyncError> {
        let pending = self.store.pending_local_changes().await.map_err(store_error)?;
        let (upload, screened) = self.arbitrate_pending(pending, cancel).await?;

        let mut committed = Vec::new();
        let exchanged = self
            .engine
            .exchange(&upload, cancel, &mut |batch: &[Measurement]| {
                committed.extend_from_slice(batch)
            })
            .await;

        // Committed batches stay committed even when a later one failed
        if !committed.is_empty() {
            self.store
                .mark_synced(&committed)
                .await
                .map_err(store_error)?;
        }

        let report = exchanged?;
        let downloaded = report.remote.len();
        let reconciled = self.reconcile(report.remote).await?;
        self.commit_cursor(report.cursor_at);
        let baseline = self.reconcile_baseline(cancel).await;

        Ok(SyncSummary {
            uploaded: report.upload.uploaded,
            batches: report.upload.batch_sizes,
            downloaded,
            applied: screened.applied + reconciled.applied,
            kept_local: screened.kept_local + reconciled.kept_local,
            merged: screened.merged + reconciled.merged,
            baseline,
        })
    }

    async fn run_download(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<SyncSummary>, SyncError> {
        let _permit = self.engine.acquire()?;
        self.session()
            .begin(SyncPhase::Downloading { retrying: false });

        let result = async {
            let report = self.engine.download(since, cancel).await?;
            let downloaded = report.records.len();
            let reconciled = self.reconcile(report.records).await?;
            self.commit_cursor(report.cursor_at);

            Ok::<_, SyncError>(SyncSummary {
                downloaded,
                applied: reconciled.applied,
                kept_local: reconciled.kept_local,
                merged: reconciled.merged,
                ..SyncSummary::default()
            })
        }
        .await;
        self.engine.conclude(result)
    }

    /// Move the cursor past records that are now stored locally
    fn commit_cursor(&self, cursor_at: Option<DateTime<Utc>>) {
        if let Some(at) = cursor_at {
            self.session().commit_cursor(at);
        }
    }

    /// Check edits of already-synced records against their current remote
    /// version before uploading them
    ///
    /// Returns what is left to upload. An edit that loses to a newer remote
    /// version is dropped and the remote version stored in its place.
    async fn arbitrate_pending(
        &self,
        pending: Vec<Measurement>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Measurement>, Reconciled), SyncError> {
        let client = self.engine.client();
        let retry = &self.engine.policy().retry;
        let mut summary = Reconciled::default();
        let mut upload = Vec::with_capacity(pending.len());
        let mut adopt = Vec::new();

        for local in pending {
            // New records and local deletions go up as they are
            if local.is_deleted || local.remote_modified_at.is_none() {
                upload.push(local);
                continue;
            }

            let key = local.key();
            let current = with_backoff(
                retry,
                cancel,
                "fetch record",
                || client.fetch_one(&key),
                |_, _, _| {},
            )
            .await?;

            let remote = match current {
                Some(remote) if remote.remote_modified_at != local.remote_modified_at => remote,
                // Untouched remotely since this device last saw it
                _ => {
                    upload.push(local);
                    continue;
                }
            };

            if local.same_payload(&remote) {
                adopt.push(remote);
                continue;
            }

            match resolve(&local, &remote, self.strategy) {
                MergeDecision::KeepRemote => {
                    debug!("Pending edit of {} lost to the remote version", key);
                    adopt.push(remote);
                }
                MergeDecision::KeepLocal => {
                    debug!("Pending edit of {} overrides the remote version", key);
                    summary.kept_local += 1;
                    upload.push(local);
                }
                MergeDecision::Merge(merged) => {
                    debug!("Pending edit of {} merged with the remote version", key);
                    summary.merged += 1;
                    self.requeue(merged.clone()).await?;
                    upload.push(merged);
                }
            }
        }

        summary.applied = adopt.len();
        if !adopt.is_empty() {
            self.store
                .apply_remote_changes(adopt)
                .await
                .map_err(store_error)?;
        }
        Ok((upload, summary))
    }

    /// Merge downloaded records into the local store
    async fn reconcile(&self, remote: Vec<Measurement>) -> Result<Reconciled, SyncError> {
        let mut summary = Reconciled::default();
        let mut apply = Vec::new();

        for incoming in remote {
            let local = self.store.find(&incoming.key()).await.map_err(store_error)?;

            let Some(local) = local else {
                apply.push(incoming);
                continue;
            };

            // A local deletion is never undone by a download
            if local.is_deleted {
                debug!("Keeping local tombstone for {}", local.key());
                continue;
            }

            if local.same_payload(&incoming) {
                // Adopt the server's modification time
                if local.remote_modified_at != incoming.remote_modified_at {
                    apply.push(incoming);
                }
                continue;
            }

            match resolve(&local, &incoming, self.strategy) {
                MergeDecision::KeepRemote => {
                    debug!("Conflict on {}: remote wins", incoming.key());
                    apply.push(incoming);
                }
                MergeDecision::KeepLocal => {
                    debug!("Conflict on {}: local wins", local.key());
                    summary.kept_local += 1;
                    self.requeue(local).await?;
                }
                MergeDecision::Merge(merged) => {
                    debug!("Conflict on {}: merged confidences", merged.key());
                    summary.merged += 1;
                    self.requeue(merged).await?;
                }
            }
        }

        summary.applied = apply.len();
        self.store
            .apply_remote_changes(apply)
            .await
            .map_err(store_error)?;
        Ok(summary)
    }

    async fn requeue(&self, record: Measurement) -> Result<(), SyncError> {
        self.store.upsert(record).await.map_err(store_error)
    }

    /// Newer `last_updated` wins wholesale
    ///
    /// Failures are logged; the baseline is retried on the next sync.
    async fn reconcile_baseline(&self, cancel: &CancellationToken) -> BaselineAction {
        match self.try_reconcile_baseline(cancel).await {
            Ok(action) => action,
            Err(e) => {
                warn!("Baseline sync failed: {}", e);
                BaselineAction::Unchanged
            }
        }
    }

    async fn try_reconcile_baseline(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BaselineAction, SyncError> {
        let client = self.engine.client();
        let retry = &self.engine.policy().retry;

        let remote = with_backoff(
            retry,
            cancel,
            "fetch baseline",
            || client.fetch_baseline(),
            |_, _, _| {},
        )
        .await?;
        let local = self
            .store
            .baseline()
            .await
            .map_err(|e| SyncError::Store(format!("{:#}", e)))?;

        match (local, remote) {
            (Some(local), Some(remote)) if remote.last_updated > local.last_updated => {
                self.pull_baseline(remote).await
            }
            (None, Some(remote)) => self.pull_baseline(remote).await,
            (Some(local), Some(remote)) if local.last_updated > remote.last_updated => {
                self.push_baseline(local, cancel).await
            }
            (Some(local), None) => self.push_baseline(local, cancel).await,
            _ => Ok(BaselineAction::Unchanged),
        }
    }

    async fn pull_baseline(&self, remote: Baseline) -> Result<BaselineAction, SyncError> {
        self.store
            .apply_baseline(remote)
            .await
            .map_err(|e| SyncError::Store(format!("{:#}", e)))?;
        debug!("Pulled newer baseline");
        Ok(BaselineAction::Pulled)
    }

    async fn push_baseline(
        &self,
        local: Baseline,
        cancel: &CancellationToken,
    ) -> Result<BaselineAction, SyncError> {
        let client = self.engine.client();
        with_backoff(
            &self.engine.policy().retry,
            cancel,
            "save baseline",
            || client.save_baseline(&local),
            |_, _, _| {},
        )
        .await?;
        debug!("Pushed newer baseline");
        Ok(BaselineAction::Pushed)
    }
}

/// The session is settled by whoever concluded the attempt
fn store_error(e: anyhow::Error) -> SyncError {
    let message = format!("{:#}", e);
    warn!("Local store error: {}", message);
    SyncError::Store(message)
}

fn log_result(trigger: &str, result: Result<SyncOutcome<SyncSummary>, SyncError>) {
    match result {
        Ok(SyncOutcome::Completed(summary)) => debug!(
            "{} sync: {} up, {} down",
            trigger, summary.uploaded, summary.downloaded
        ),
        Ok(SyncOutcome::Throttled { .. }) => debug!("{} sync throttled", trigger),
        Ok(SyncOutcome::Cancelled) => debug!("{} sync cancelled", trigger),
        Err(SyncError::AlreadySyncing) => debug!("{} sync skipped, already syncing", trigger),
        Err(e) => warn!("{} sync failed: {}", trigger, e),
    }
}
