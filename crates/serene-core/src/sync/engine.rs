//! Sync engine
//!
//! Batched upload and incremental download over a [`RemoteClient`], with
//! retry and backoff. One engine serves both device classes; the
//! [`SyncPolicy`] carries what differs.
//!
//! At most one operation runs per engine. A second caller is rejected with
//! [`SyncError::AlreadySyncing`] instead of queueing.
//!
//! The engine never moves the fetch cursor. Download reports carry the
//! candidate `cursor_at`; the caller commits it through
//! [`SyncSession::commit_cursor`] once the records are stored locally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::SyncPolicy;
use super::retry::with_backoff;
use super::session::SyncSession;
use super::state::{SyncEvent, SyncPhase};
use crate::models::Measurement;
use crate::remote::{RemoteClient, RemoteError};

/// Tombstone deletes issued concurrently during a purge
const PURGE_CONCURRENCY: usize = 4;

/// Sync errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("A sync is already in progress")]
    AlreadySyncing,

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Local store error: {0}")]
    Store(String),
}

/// How a sync operation ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    Completed(T),
    /// Abandoned through the cancellation token
    Cancelled,
    /// Skipped by the throttle; nothing was sent
    Throttled {
        next_allowed_at: Option<DateTime<Utc>>,
    },
}

impl<T> SyncOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            SyncOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SyncOutcome<U> {
        match self {
            SyncOutcome::Completed(value) => SyncOutcome::Completed(f(value)),
            SyncOutcome::Cancelled => SyncOutcome::Cancelled,
            SyncOutcome::Throttled { next_allowed_at } => {
                SyncOutcome::Throttled { next_allowed_at }
            }
        }
    }
}

/// Result of an upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Sizes of the committed batches, in order
    pub batch_sizes: Vec<usize>,
    pub uploaded: usize,
}

/// Result of a download
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadReport {
    /// Live remote measurements, newest first
    pub records: Vec<Measurement>,
    /// Where the cursor may move once `records` are stored; `None` when the
    /// fetch did not reach back to the current cursor
    pub cursor_at: Option<DateTime<Utc>>,
}

/// Result of a full upload-then-download sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub upload: UploadReport,
    /// Remote measurements changed since the previous cursor, newest first
    pub remote: Vec<Measurement>,
    /// Where the cursor may move once `remote` is stored
    pub cursor_at: Option<DateTime<Utc>>,
}

/// Earliest capture time a background fetch covers
///
/// The later of the last sync and `now - window`.
pub fn background_since(
    last_sync_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> DateTime<Utc> {
    let floor = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    match last_sync_date {
        Some(last) => last.max(floor),
        None => floor,
    }
}

pub struct SyncEngine<C: ?Sized> {
    client: Arc<C>,
    session: Arc<SyncSession>,
    policy: SyncPolicy,
    in_flight: Semaphore,
}

impl<C: RemoteClient + ?Sized> SyncEngine<C> {
    pub fn new(client: Arc<C>, session: Arc<SyncSession>, policy: SyncPolicy) -> Self {
        Self {
            client,
            session,
            policy,
            in_flight: Semaphore::new(1),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Whether an operation currently holds the engine
    pub fn is_busy(&self) -> bool {
        self.in_flight.available_permits() == 0
    }

    /// Upload records in policy-sized batches
    pub async fn upload_measurements(
        &self,
        records: &[Measurement],
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<UploadReport>, SyncError> {
        self.upload_measurements_with(records, cancel, |_| {}).await
    }

    /// Upload records, calling `on_commit` with the stored versions of each
    /// batch once it is committed remotely
    ///
    /// Batches committed before a failure stay committed.
    pub async fn upload_measurements_with<F>(
        &self,
        records: &[Measurement],
        cancel: &CancellationToken,
        mut on_commit: F,
    ) -> Result<SyncOutcome<UploadReport>, SyncError>
    where
        F: FnMut(&[Measurement]) + Send,
    {
        let _permit = self.acquire()?;
        info!("Uploading {} measurement(s)", records.len());

        self.session.begin(SyncPhase::Uploading { retrying: false });
        let result = self
            .upload_batches(records, cancel, 0.0, 1.0, &mut on_commit)
            .await;
        self.conclude(result)
    }

    /// Fetch live remote measurements captured at or after `since`
    pub async fn download_measurements(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<DownloadReport>, SyncError> {
        let _permit = self.acquire()?;
        self.session.begin(SyncPhase::Downloading { retrying: false });
        let result = self.download(since, cancel).await;
        self.conclude(result)
    }

    /// Upload `local`, then fetch everything changed since the cursor
    pub async fn sync(
        &self,
        local: &[Measurement],
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<SyncReport>, SyncError> {
        self.sync_with(local, cancel, |_| {}).await
    }

    /// [`sync`](Self::sync) with a per-batch commit callback
    pub async fn sync_with<F>(
        &self,
        local: &[Measurement],
        cancel: &CancellationToken,
        mut on_commit: F,
    ) -> Result<SyncOutcome<SyncReport>, SyncError>
    where
        F: FnMut(&[Measurement]) + Send,
    {
        let _permit = self.acquire()?;
        self.session.begin(SyncPhase::Uploading { retrying: false });
        let result = self.exchange(local, cancel, &mut on_commit).await;
        self.conclude(result)
    }

    /// Download-only sync bounded to the background window
    pub async fn perform_background_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome<DownloadReport>, SyncError> {
        self.download_measurements(Some(self.background_since()), cancel)
            .await
    }

    /// Physically delete the remote counterparts of tombstoned records
    ///
    /// Live records in `records` are ignored. Returns how many were purged.
    pub async fn purge_tombstones(
        &self,
        records: &[Measurement],
        cancel: &CancellationToken,
    ) -> Result<usize, SyncError> {
        let _permit = self.acquire()?;
        self.purge(records, cancel).await
    }

    /// Claim the engine for one operation
    pub(crate) fn acquire(&self) -> Result<SemaphorePermit<'_>, SyncError> {
        self.in_flight.try_acquire().map_err(|_| {
            debug!("Rejecting overlapping sync request");
            SyncError::AlreadySyncing
        })
    }

    pub(crate) fn background_since(&self) -> DateTime<Utc> {
        let since = background_since(
            self.session.last_sync_date(),
            Utc::now(),
            self.policy.background_window,
        );
        debug!("Background sync since {}", since);
        since
    }

    /// Upload then download within an attempt the caller has begun
    pub(crate) async fn exchange<F>(
        &self,
        local: &[Measurement],
        cancel: &CancellationToken,
        on_commit: &mut F,
    ) -> Result<SyncReport, SyncError>
    where
        F: FnMut(&[Measurement]) + Send,
    {
        let started = Utc::now();
        let since = self.session.last_sync_date();
        info!(
            "Starting sync: {} pending change(s), cursor {:?}",
            local.len(),
            since
        );

        let upload = self
            .upload_batches(local, cancel, 0.0, 0.5, on_commit)
            .await?;

        self.session
            .set_phase(SyncPhase::Downloading { retrying: false });
        let remote = self.fetch_since(since, cancel).await?;
        self.session.set_progress(1.0);

        info!(
            "Sync complete: {} uploaded, {} downloaded",
            upload.uploaded,
            remote.len()
        );
        Ok(SyncReport {
            upload,
            remote,
            cursor_at: Some(started),
        })
    }

    /// Fetch within an attempt the caller has begun
    ///
    /// Offers the cursor only when the fetch reached back at least as far as
    /// the current cursor, so a narrower window never hides older changes.
    pub(crate) async fn download(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, SyncError> {
        let started = Utc::now();
        let cursor_at = self.reaches_cursor(since).then_some(started);
        debug!("Downloading measurements since {:?}", since);

        let records = self.fetch_since(since, cancel).await?;
        self.session.set_progress(1.0);
        info!("Downloaded {} measurement(s)", records.len());
        Ok(DownloadReport { records, cursor_at })
    }

    /// Purge within an operation holding the engine
    pub(crate) async fn purge(
        &self,
        records: &[Measurement],
        cancel: &CancellationToken,
    ) -> Result<usize, SyncError> {
        let tombstones: Vec<&Measurement> = records.iter().filter(|r| r.is_deleted).collect();
        if tombstones.is_empty() {
            return Ok(0);
        }

        let retry = &self.policy.retry;
        let client = &self.client;
        let purged = stream::iter(tombstones)
            .map(move |record| {
                with_backoff(
                    retry,
                    cancel,
                    "purge tombstone",
                    move || client.delete(record),
                    |_, _, _| {},
                )
            })
            .buffer_unordered(PURGE_CONCURRENCY)
            .try_fold(0usize, |count, ()| async move { Ok(count + 1) })
            .await?;

        info!("Purged {} tombstone(s)", purged);
        Ok(purged)
    }

    /// Upload in batches, mapping batch progress onto `start..start + span`
    async fn upload_batches<F>(
        &self,
        records: &[Measurement],
        cancel: &CancellationToken,
        start: f64,
        span: f64,
        on_commit: &mut F,
    ) -> Result<UploadReport, SyncError>
    where
        F: FnMut(&[Measurement]) + Send,
    {
        let batch_size = self.policy.batch_size.max(1);
        let total = records.len().div_ceil(batch_size);
        let mut report = UploadReport::default();

        for (index, batch) in records.chunks(batch_size).enumerate() {
            debug!(
                "Uploading batch {}/{} ({} records)",
                index + 1,
                total,
                batch.len()
            );

            let stored = with_backoff(
                &self.policy.retry,
                cancel,
                "upload batch",
                || self.client.save_batch(batch),
                |attempt, delay, e| {
                    self.note_retry(SyncPhase::Uploading { retrying: true }, attempt, delay, e)
                },
            )
            .await?;

            self.session
                .set_phase(SyncPhase::Uploading { retrying: false });
            on_commit(&stored);
            report.batch_sizes.push(batch.len());
            report.uploaded += batch.len();

            self.session.emit(SyncEvent::BatchCommitted {
                index,
                total,
                size: batch.len(),
            });
            self.session
                .set_progress(start + span * (index + 1) as f64 / total as f64);
        }

        if total == 0 {
            self.session.set_progress(start + span);
        }
        Ok(report)
    }

    async fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Measurement>, SyncError> {
        with_backoff(
            &self.policy.retry,
            cancel,
            "download",
            || self.client.fetch(since),
            |attempt, delay, e| {
                self.note_retry(SyncPhase::Downloading { retrying: true }, attempt, delay, e)
            },
        )
        .await
    }

    fn note_retry(&self, phase: SyncPhase, attempt: u32, delay: Duration, error: &RemoteError) {
        self.session.set_phase(phase);
        self.session.emit(SyncEvent::Retrying {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error: error.to_string(),
        });
    }

    fn reaches_cursor(&self, since: Option<DateTime<Utc>>) -> bool {
        match (since, self.session.last_sync_date()) {
            (None, _) => true,
            (Some(since), Some(cursor)) => since <= cursor,
            (Some(_), None) => false,
        }
    }

    /// Settle session state for the attempt the caller owns
    pub(crate) fn conclude<T>(
        &self,
        result: Result<T, SyncError>,
    ) -> Result<SyncOutcome<T>, SyncError> {
        match result {
            Ok(value) => {
                self.session.finish_success();
                Ok(SyncOutcome::Completed(value))
            }
            Err(SyncError::Cancelled) => {
                info!("Sync cancelled");
                self.session.finish_cancelled();
                Ok(SyncOutcome::Cancelled)
            }
            Err(e) => {
                warn!("Sync failed: {}", e);
                self.session.finish_failure(e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::sync::retry::RetryPolicy;
    use crate::sync::state::{SyncCursor, SyncStatus};
    use crate::sync::test_helpers::{series, t0, ScriptedClient};
    use tokio::time::Instant;

    fn engine_with(
        client: Arc<ScriptedClient>,
        policy: SyncPolicy,
        cursor: SyncCursor,
    ) -> SyncEngine<ScriptedClient> {
        let session = Arc::new(SyncSession::with_cursor(
            DeviceIdentity::from_id("phone-1"),
            cursor,
        ));
        SyncEngine::new(client, session, policy)
    }

    fn engine(client: Arc<ScriptedClient>) -> SyncEngine<ScriptedClient> {
        engine_with(client, SyncPolicy::primary(), SyncCursor::new())
    }

    fn progress_events(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<f64> {
        let mut values = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Progress(p) = event {
                values.push(p);
            }
        }
        values
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_23_records_with_flaky_second_batch() {
        let client = Arc::new(ScriptedClient::new());
        // batch 1 ok, batch 2 fails twice, then everything succeeds
        client.script_saves([
            None,
            Some(RemoteError::no_internet()),
            Some(RemoteError::rate_limited()),
        ]);
        let engine = engine(Arc::clone(&client));
        let mut events = engine.session().subscribe_events();
        let records = series("phone-1", 23);

        let start = Instant::now();
        let outcome = engine
            .upload_measurements(&records, &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();

        let report = outcome.completed().unwrap();
        assert_eq!(report.batch_sizes, vec![10, 10, 3]);
        assert_eq!(report.uploaded, 23);
        assert_eq!(client.batch_sizes(), vec![10, 10, 3]);
        assert_eq!(client.remote_count(), 23);

        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(7));

        assert_eq!(
            progress_events(&mut events),
            vec![1.0 / 3.0, 2.0 / 3.0, 1.0]
        );
        assert_eq!(engine.session().sync_progress(), 1.0);
        assert!(!engine.session().is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_events_report_backoff_delays() {
        let client = Arc::new(ScriptedClient::new());
        client.script_saves([
            Some(RemoteError::no_internet()),
            Some(RemoteError::no_internet()),
        ]);
        let engine = engine(Arc::clone(&client));
        let mut events = engine.session().subscribe_events();

        engine
            .upload_measurements(&series("phone-1", 2), &CancellationToken::new())
            .await
            .unwrap();

        let mut delays = Vec::new();
        let mut saw_retrying_phase = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SyncEvent::Retrying { delay_ms, .. } => delays.push(delay_ms),
                SyncEvent::PhaseChanged(SyncPhase::Uploading { retrying: true }) => {
                    saw_retrying_phase = true
                }
                _ => {}
            }
        }
        assert_eq!(delays, vec![2000, 4000]);
        assert!(saw_retrying_phase);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_abort_without_rollback() {
        let client = Arc::new(ScriptedClient::new());
        client.script_saves([
            None,
            Some(RemoteError::no_internet()),
            Some(RemoteError::no_internet()),
            Some(RemoteError::no_internet()),
        ]);
        let engine = engine(Arc::clone(&client));

        let mut committed = Vec::new();
        let result = engine
            .upload_measurements_with(&series("phone-1", 23), &CancellationToken::new(), |batch| {
                committed.extend(batch.iter().map(Measurement::key))
            })
            .await;

        assert!(matches!(
            result,
            Err(SyncError::Remote(RemoteError::NetworkUnavailable(_)))
        ));
        // First batch stays committed; third is never attempted
        assert_eq!(client.remote_count(), 10);
        assert_eq!(committed.len(), 10);
        assert_eq!(client.network_calls(), 4);

        let state = engine.session().state();
        assert!(!state.is_syncing);
        assert_eq!(state.phase, SyncPhase::Idle);
        assert!(state.last_error.is_some());
        assert!(matches!(engine.session().status(), SyncStatus::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_surfaces_immediately() {
        let client = Arc::new(ScriptedClient::new());
        client.script_saves([Some(RemoteError::ZoneNotFound)]);
        let engine = engine(Arc::clone(&client));

        let start = Instant::now();
        let result = engine
            .sync(&series("phone-1", 3), &CancellationToken::new())
            .await;

        assert_eq!(result, Err(SyncError::Remote(RemoteError::ZoneNotFound)));
        assert!(start.elapsed() < Duration::from_millis(1));
        assert_eq!(client.network_calls(), 1);
        assert!(!engine.session().is_syncing());
        // Upload failure short-circuits the download
        assert!(client.fetch_sinces().is_empty());
        assert!(engine.session().last_sync_date().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_batch_is_not_duplicated() {
        let client = Arc::new(ScriptedClient::new());
        client.script_saves([Some(RemoteError::no_internet())]);
        let engine = engine(Arc::clone(&client));
        let records = series("phone-1", 4);

        engine
            .upload_measurements(&records, &CancellationToken::new())
            .await
            .unwrap();
        engine
            .upload_measurements(&records, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.remote_count(), 4);
    }

    #[tokio::test]
    async fn test_sync_uploads_then_downloads() {
        let client = Arc::new(ScriptedClient::new());
        client.seed(series("watch-1", 2));
        let engine = engine(Arc::clone(&client));
        let mut events = engine.session().subscribe_events();

        let before = Utc::now();
        let report = engine
            .sync(&series("phone-1", 12), &CancellationToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(report.upload.batch_sizes, vec![10, 2]);
        assert_eq!(report.remote.len(), 14);
        assert!(report
            .remote
            .windows(2)
            .all(|w| w[0].timestamp >= w[1].timestamp));

        // First sync fetches everything
        assert_eq!(client.fetch_sinces(), vec![None]);
        assert_eq!(progress_events(&mut events), vec![0.25, 0.5, 1.0]);

        // The cursor is offered, not committed
        let cursor_at = report.cursor_at.unwrap();
        assert!(cursor_at >= before);
        assert!(engine.session().last_sync_date().is_none());
        assert_eq!(engine.session().status(), SyncStatus::Success);
    }

    #[tokio::test]
    async fn test_second_sync_fetches_since_cursor() {
        let client = Arc::new(ScriptedClient::new());
        let engine = engine(Arc::clone(&client));
        let cancel = CancellationToken::new();

        let report = engine.sync(&[], &cancel).await.unwrap().completed().unwrap();
        let cursor = engine.session().commit_cursor(report.cursor_at.unwrap());
        engine.sync(&[], &cancel).await.unwrap();

        assert_eq!(client.fetch_sinces(), vec![None, cursor]);
    }

    #[tokio::test]
    async fn test_empty_upload_completes() {
        let client = Arc::new(ScriptedClient::new());
        let engine = engine(Arc::clone(&client));

        let report = engine
            .upload_measurements(&[], &CancellationToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert!(report.batch_sizes.is_empty());
        assert_eq!(client.network_calls(), 0);
        assert_eq!(engine.session().sync_progress(), 1.0);
    }

    #[tokio::test]
    async fn test_companion_batches_of_five() {
        let client = Arc::new(ScriptedClient::new());
        let engine = engine_with(
            Arc::clone(&client),
            SyncPolicy::companion(),
            SyncCursor::new(),
        );

        engine
            .upload_measurements(&series("watch-1", 12), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.batch_sizes(), vec![5, 5, 2]);
    }

    #[test]
    fn test_background_since_bounds() {
        let now = t0();
        let day = Duration::from_secs(24 * 3600);

        let recent = now - chrono::Duration::hours(10);
        assert_eq!(background_since(Some(recent), now, day), recent);

        let stale = now - chrono::Duration::hours(30);
        assert_eq!(
            background_since(Some(stale), now, day),
            now - chrono::Duration::hours(24)
        );
        assert_eq!(
            background_since(None, now, day),
            now - chrono::Duration::hours(24)
        );
    }

    #[tokio::test]
    async fn test_background_sync_uses_recent_cursor() {
        let client = Arc::new(ScriptedClient::new());
        let ten_hours_ago = Utc::now() - chrono::Duration::hours(10);
        let mut cursor = SyncCursor::new();
        cursor.advance(ten_hours_ago).unwrap();
        let engine = engine_with(Arc::clone(&client), SyncPolicy::primary(), cursor);

        let report = engine
            .perform_background_sync(&CancellationToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(client.fetch_sinces(), vec![Some(ten_hours_ago)]);
        // Download only
        assert!(client.batch_sizes().is_empty());
        // The fetch reached back to the cursor, so it may advance
        assert!(report.cursor_at.unwrap() > ten_hours_ago);
        assert_eq!(engine.session().last_sync_date(), Some(ten_hours_ago));
    }

    #[tokio::test]
    async fn test_narrow_download_keeps_cursor() {
        let client = Arc::new(ScriptedClient::new());
        let engine = engine(Arc::clone(&client));

        let narrow = engine
            .download_measurements(Some(Utc::now()), &CancellationToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert!(narrow.cursor_at.is_none());

        let full = engine
            .download_measurements(None, &CancellationToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert!(full.cursor_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_retries_transient_errors() {
        let client = Arc::new(ScriptedClient::new());
        client.script_fetches([Some(RemoteError::rate_limited())]);
        client.seed(series("watch-1", 3));
        let engine = engine(Arc::clone(&client));

        let start = Instant::now();
        let report = engine
            .download_measurements(None, &CancellationToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(report.records.len(), 3);
        assert_eq!(client.fetch_sinces().len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancelled_sync_is_not_an_error() {
        let client = Arc::new(ScriptedClient::new());
        let engine = engine(Arc::clone(&client));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine.sync(&series("phone-1", 3), &cancel).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Cancelled);
        assert_eq!(client.network_calls(), 0);
        assert_eq!(engine.session().status(), SyncStatus::Idle);
        assert!(engine.session().state().last_error.is_none());
        assert!(!engine.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_sync_rejected() {
        let client = Arc::new(ScriptedClient::new());
        client.script_saves([Some(RemoteError::no_internet())]);
        let engine = Arc::new(engine(Arc::clone(&client)));
        let cancel = CancellationToken::new();

        let background = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.sync(&series("phone-1", 3), &cancel).await })
        };
        while !engine.is_busy() {
            tokio::task::yield_now().await;
        }

        let second = engine.sync(&[], &CancellationToken::new()).await;
        assert_eq!(second, Err(SyncError::AlreadySyncing));
        // The rejected call does not disturb the running one
        assert!(engine.session().is_syncing());

        cancel.cancel();
        let first = background.await.unwrap().unwrap();
        assert_eq!(first, SyncOutcome::Cancelled);
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_purge_deletes_only_tombstones() {
        let client = Arc::new(ScriptedClient::new());
        let mut records = series("phone-1", 3);
        records[0].tombstone();
        records[2].tombstone();
        client.seed(records.clone());
        let engine = engine(Arc::clone(&client));

        let purged = engine
            .purge_tombstones(&records, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(purged, 2);
        assert_eq!(client.delete_calls(), 2);
        assert_eq!(client.remote_count(), 1);
        assert!(client.remote(&records[1].key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_waits_for_running_sync() {
        let client = Arc::new(ScriptedClient::new());
        client.script_saves([Some(RemoteError::no_internet())]);
        let mut tombstone = series("phone-1", 1).remove(0);
        tombstone.tombstone();
        client.seed([tombstone.clone()]);
        let engine = Arc::new(engine(Arc::clone(&client)));
        let cancel = CancellationToken::new();

        let running = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.sync(&series("phone-1", 3), &cancel).await })
        };
        while !engine.is_busy() {
            tokio::task::yield_now().await;
        }

        let purge = engine
            .purge_tombstones(std::slice::from_ref(&tombstone), &CancellationToken::new())
            .await;
        assert_eq!(purge, Err(SyncError::AlreadySyncing));
        assert_eq!(client.delete_calls(), 0);

        cancel.cancel();
        running.await.unwrap().unwrap();
        let purged = engine
            .purge_tombstones(std::slice::from_ref(&tombstone), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_custom_retry_policy() {
        let client = Arc::new(ScriptedClient::new());
        client.script_saves([Some(RemoteError::no_internet())]);
        let policy = SyncPolicy::primary().with_retry(RetryPolicy::new(1, Duration::ZERO));
        let engine = engine_with(Arc::clone(&client), policy, SyncCursor::new());

        let result = engine
            .upload_measurements(&series("phone-1", 1), &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(client.network_calls(), 1);
    }
}
