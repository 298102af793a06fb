//! Sync session
//!
//! Explicitly constructed owner of a device's sync state. Shared (via
//! `Arc`) by the remote client, the engine and the coordinator, and handed
//! to UI collaborators as a read-only observable.
//!
//! All mutation goes through `watch::Sender::send_modify`, so observers
//! always read a whole snapshot, never a half-updated one.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::warn;

use super::state::{SyncCursor, SyncEvent, SyncPhase, SyncState, SyncStatus};
use crate::identity::DeviceIdentity;
use crate::remote::RemoteError;

pub struct SyncSession {
    identity: DeviceIdentity,
    state_tx: watch::Sender<SyncState>,
    status_tx: watch::Sender<SyncStatus>,
    event_tx: broadcast::Sender<SyncEvent>,
    cursor: Mutex<SyncCursor>,
}

impl SyncSession {
    /// Create a session with an in-memory cursor
    pub fn new(identity: DeviceIdentity) -> Self {
        Self::with_cursor(identity, SyncCursor::new())
    }

    /// Create a session resuming from a (possibly persisted) cursor
    pub fn with_cursor(identity: DeviceIdentity, cursor: SyncCursor) -> Self {
        let state = SyncState {
            last_sync_date: cursor.last_sync_date(),
            ..SyncState::default()
        };
        let (state_tx, _) = watch::channel(state);
        let (status_tx, _) = watch::channel(SyncStatus::Idle);
        let (event_tx, _) = broadcast::channel(256);

        Self {
            identity,
            state_tx,
            status_tx,
            event_tx,
            cursor: Mutex::new(cursor),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current state snapshot
    pub fn state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn sync_progress(&self) -> f64 {
        self.state_tx.borrow().progress
    }

    pub fn is_syncing(&self) -> bool {
        self.state_tx.borrow().is_syncing
    }

    pub fn last_sync_date(&self) -> Option<DateTime<Utc>> {
        self.state_tx.borrow().last_sync_date
    }

    pub fn last_remote_activity(&self) -> Option<DateTime<Utc>> {
        self.state_tx.borrow().last_remote_activity
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_status(&self, status: SyncStatus) {
        self.status_tx.send_replace(status.clone());
        self.emit(SyncEvent::StatusChanged(status));
    }

    /// Enter a new sync attempt
    pub(crate) fn begin(&self, phase: SyncPhase) {
        self.state_tx.send_modify(|s| {
            s.is_syncing = true;
            s.progress = 0.0;
            s.phase = phase;
            s.last_error = None;
        });
        self.emit(SyncEvent::PhaseChanged(phase));
        self.set_status(SyncStatus::Syncing { progress: 0.0 });
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        let changed = self.state_tx.send_if_modified(|s| {
            if s.phase == phase {
                false
            } else {
                s.phase = phase;
                true
            }
        });
        if changed {
            self.emit(SyncEvent::PhaseChanged(phase));
        }
    }

    pub(crate) fn set_progress(&self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        self.state_tx.send_modify(|s| s.progress = progress);
        self.status_tx
            .send_replace(SyncStatus::Syncing { progress });
        self.emit(SyncEvent::Progress(progress));
    }

    /// Advance the fetch cursor to `at`
    ///
    /// Call only once everything fetched up to `at` is stored locally. The
    /// cursor never moves backwards; returns where it ends up.
    pub fn commit_cursor(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last_sync_date = {
            let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = cursor.advance(at) {
                // Only costs a wider fetch window next time
                warn!("Failed to persist sync cursor: {:#}", e);
            }
            cursor.last_sync_date()
        };
        self.state_tx
            .send_modify(|s| s.last_sync_date = last_sync_date);
        last_sync_date
    }

    /// Complete the attempt successfully
    pub(crate) fn finish_success(&self) {
        self.state_tx.send_modify(|s| {
            s.is_syncing = false;
            s.progress = 1.0;
            s.phase = SyncPhase::Idle;
        });
        self.emit(SyncEvent::PhaseChanged(SyncPhase::Idle));
        self.set_status(SyncStatus::Success);
    }

    /// Complete the attempt with an error
    pub(crate) fn finish_failure(&self, message: String) {
        self.state_tx.send_modify(|s| {
            s.is_syncing = false;
            s.phase = SyncPhase::Failed;
            s.last_error = Some(message.clone());
        });
        self.emit(SyncEvent::PhaseChanged(SyncPhase::Failed));
        self.set_status(SyncStatus::Error(message));

        self.state_tx.send_modify(|s| s.phase = SyncPhase::Idle);
        self.emit(SyncEvent::PhaseChanged(SyncPhase::Idle));
    }

    /// Abandon the attempt without recording an error
    pub(crate) fn finish_cancelled(&self) {
        self.state_tx.send_modify(|s| {
            s.is_syncing = false;
            s.phase = SyncPhase::Idle;
        });
        self.emit(SyncEvent::PhaseChanged(SyncPhase::Idle));
        self.set_status(SyncStatus::Idle);
    }

    /// A standalone remote operation started
    ///
    /// Operations issued by a running sync leave the status to the engine.
    pub(crate) fn remote_op_started(&self) {
        if !self.is_syncing() {
            self.set_status(SyncStatus::Syncing { progress: 0.0 });
        }
    }

    pub(crate) fn remote_op_finished(&self, error: Option<&RemoteError>) {
        let now = Utc::now();
        self.state_tx
            .send_modify(|s| s.last_remote_activity = Some(now));

        if !self.is_syncing() {
            match error {
                Some(e) => self.set_status(SyncStatus::Error(e.to_string())),
                None => self.set_status(SyncStatus::Success),
            }
        }
    }
}
