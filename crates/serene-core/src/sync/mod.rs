//! Measurement sync
//!
//! Moves measurements between the local store and the shared remote store
//! for one device.
//!
//! ## Flow
//!
//! 1. The local store hands over its pending changes
//! 2. The throttle admits or skips automatic attempts
//! 3. The engine uploads in batches with retry, then fetches since the cursor
//! 4. The conflict resolver decides which version of each record survives
//! 5. Push notifications trigger the same download asynchronously
//!
//! ## Usage
//!
//! ```ignore
//! let session = Arc::new(SyncSession::with_cursor(identity, cursor));
//! let client = Arc::new(CloudClient::new(backend, session.clone(), policy.subscription.clone()));
//! let coordinator = SyncCoordinator::new(client, session, store, policy, strategy);
//! coordinator.sync_user_initiated(&cancel).await?;
//! ```

mod conflict;
mod coordinator;
mod engine;
mod policy;
mod retry;
mod session;
mod state;
mod throttle;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use conflict::{resolve, ConflictStrategy, MergeDecision, StrategyKind};
pub use coordinator::{BaselineAction, SyncCoordinator, SyncSummary};
pub use engine::{
    background_since, DownloadReport, SyncEngine, SyncError, SyncOutcome, SyncReport, UploadReport,
};
pub use policy::{
    SyncPolicy, BACKGROUND_WINDOW, COMPANION_BATCH_SIZE, COMPANION_THROTTLE, PRIMARY_BATCH_SIZE,
};
pub use retry::{with_backoff, RetryPolicy};
pub use session::SyncSession;
pub use state::{SyncCursor, SyncEvent, SyncPhase, SyncState, SyncStatus};
pub use throttle::ThrottleController;
