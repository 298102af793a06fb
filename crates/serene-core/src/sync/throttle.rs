//! Sync throttling
//!
//! Rate-limits automatic sync attempts on constrained devices. The
//! controller is a plain value; owners wrap it in whatever lock they need.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Tracks the last attempt and the minimum interval between attempts
#[derive(Debug, Clone, Default)]
pub struct ThrottleController {
    interval: Option<Duration>,
    last_attempt: Option<DateTime<Utc>>,
}

impl ThrottleController {
    /// `None` means never throttle
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last_attempt: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }

    pub fn should_sync_now(&self) -> bool {
        self.should_sync_at(Utc::now())
    }

    /// True when no interval is configured, nothing has been attempted yet,
    /// or at least the interval has elapsed since the last attempt
    pub fn should_sync_at(&self, now: DateTime<Utc>) -> bool {
        match self.next_allowed_at() {
            None => true,
            Some(next) => now >= next,
        }
    }

    /// Earliest time the next attempt is allowed, if throttled at all
    pub fn next_allowed_at(&self) -> Option<DateTime<Utc>> {
        let interval = self.interval?;
        let last = self.last_attempt?;
        let interval = chrono::Duration::from_std(interval).ok()?;
        last.checked_add_signed(interval)
    }

    /// Record an attempt, successful or not
    ///
    /// A timestamp earlier than the one already recorded is ignored.
    pub fn record_attempt(&mut self, at: DateTime<Utc>) {
        if self.last_attempt.map_or(true, |last| at > last) {
            self.last_attempt = Some(at);
        }
    }
}
