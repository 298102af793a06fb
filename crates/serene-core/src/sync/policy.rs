//! Per-device sync policy
//!
//! Both device classes run the same engine and client; everything that
//! differs between them lives in a [`SyncPolicy`].

use std::time::Duration;

use super::retry::RetryPolicy;
use crate::config::SyncOverrides;
use crate::identity::DeviceClass;
use crate::remote::SubscriptionOptions;

/// Default batch size on the primary device
pub const PRIMARY_BATCH_SIZE: usize = 10;
/// Default batch size on a companion device
pub const COMPANION_BATCH_SIZE: usize = 5;
/// Minimum time between automatic syncs on a companion device
pub const COMPANION_THROTTLE: Duration = Duration::from_secs(5 * 60);
/// Widest window a background fetch may cover
pub const BACKGROUND_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Device-specific sync behavior
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPolicy {
    /// Records per upload batch (at least 1)
    pub batch_size: usize,
    /// Minimum time between automatic syncs; `None` disables throttling
    pub throttle_interval: Option<Duration>,
    pub retry: RetryPolicy,
    pub subscription: SubscriptionOptions,
    /// Upper bound on how far back a background fetch reaches
    pub background_window: Duration,
}

impl SyncPolicy {
    /// Phone: large batches, never throttled
    pub fn primary() -> Self {
        Self {
            batch_size: PRIMARY_BATCH_SIZE,
            throttle_interval: None,
            retry: RetryPolicy::default(),
            subscription: SubscriptionOptions::all_changes("measurement-changes-primary"),
            background_window: BACKGROUND_WINDOW,
        }
    }

    /// Watch: small batches, automatic syncs throttled
    pub fn companion() -> Self {
        Self {
            batch_size: COMPANION_BATCH_SIZE,
            throttle_interval: Some(COMPANION_THROTTLE),
            retry: RetryPolicy::default(),
            subscription: SubscriptionOptions::all_changes("measurement-changes-companion"),
            background_window: BACKGROUND_WINDOW,
        }
    }

    pub fn for_class(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Primary => Self::primary(),
            DeviceClass::Companion => Self::companion(),
        }
    }

    /// Apply configured overrides
    ///
    /// A throttle of zero seconds disables throttling.
    pub fn with_overrides(mut self, overrides: &SyncOverrides) -> Self {
        if let Some(size) = overrides.batch_size {
            self.batch_size = size.max(1);
        }
        if let Some(secs) = overrides.throttle_secs {
            self.throttle_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(retries) = overrides.max_retries {
            self.retry.max_retries = retries.max(1);
        }
        if let Some(ms) = overrides.base_delay_ms {
            self.retry.base_delay = Duration::from_millis(ms);
        }
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_throttle(mut self, interval: Option<Duration>) -> Self {
        self.throttle_interval = interval;
        self
    }
}
