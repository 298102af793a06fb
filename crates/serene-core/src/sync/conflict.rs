//! Conflict resolution
//!
//! When the same logical measurement `(timestamp, device_id)` exists locally
//! and remotely with different payloads, [`resolve`] decides which version
//! survives. It is pure: no I/O, no clock.
//!
//! Merging only ever unions `confidence_samples`. Scalar fields are never
//! combined; if they disagree one whole version wins.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::identity::DeviceClass;
use crate::models::Measurement;

/// Strategy names as they appear in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Timestamp,
    DevicePriority,
    Server,
    Client,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Timestamp => "timestamp",
            StrategyKind::DevicePriority => "device_priority",
            StrategyKind::Server => "server",
            StrategyKind::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "timestamp" => Some(StrategyKind::Timestamp),
            "device_priority" | "devicepriority" => Some(StrategyKind::DevicePriority),
            "server" => Some(StrategyKind::Server),
            "client" => Some(StrategyKind::Client),
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved strategy for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Most recent `remote_modified_at` wins; ties keep local
    Timestamp,
    /// Most recent `remote_modified_at` wins; ties go to the priority device
    DevicePriority {
        /// Whether this device is the priority device
        local_wins_ties: bool,
    },
    /// Remote always wins
    Server,
    /// Local always wins
    Client,
}

impl ConflictStrategy {
    /// Build the strategy for a device of class `local`
    pub fn from_config(kind: StrategyKind, local: DeviceClass, priority: DeviceClass) -> Self {
        match kind {
            StrategyKind::Timestamp => ConflictStrategy::Timestamp,
            StrategyKind::DevicePriority => ConflictStrategy::DevicePriority {
                local_wins_ties: local == priority,
            },
            StrategyKind::Server => ConflictStrategy::Server,
            StrategyKind::Client => ConflictStrategy::Client,
        }
    }
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::Timestamp
    }
}

/// Outcome of a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    KeepLocal,
    KeepRemote,
    /// Both sides agree on every scalar; the carried value unions the
    /// additive fields
    Merge(Measurement),
}

/// Decide between two versions of the same logical measurement
pub fn resolve(
    local: &Measurement,
    remote: &Measurement,
    strategy: ConflictStrategy,
) -> MergeDecision {
    if local.same_payload(remote) {
        return MergeDecision::KeepLocal;
    }

    if local.same_scalars(remote) {
        return MergeDecision::Merge(merge_additive(local, remote));
    }

    match strategy {
        ConflictStrategy::Server => MergeDecision::KeepRemote,
        ConflictStrategy::Client => MergeDecision::KeepLocal,
        ConflictStrategy::Timestamp => match compare_modified(local, remote) {
            Ordering::Less => MergeDecision::KeepRemote,
            _ => MergeDecision::KeepLocal,
        },
        ConflictStrategy::DevicePriority { local_wins_ties } => {
            match compare_modified(local, remote) {
                Ordering::Less => MergeDecision::KeepRemote,
                Ordering::Greater => MergeDecision::KeepLocal,
                Ordering::Equal if local_wins_ties => MergeDecision::KeepLocal,
                Ordering::Equal => MergeDecision::KeepRemote,
            }
        }
    }
}

/// Order by remote modification time; a known time beats an unknown one
fn compare_modified(local: &Measurement, remote: &Measurement) -> Ordering {
    match (local.remote_modified_at, remote.remote_modified_at) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Union confidence samples, keeping local order and appending unseen
/// remote samples
fn merge_additive(local: &Measurement, remote: &Measurement) -> Measurement {
    let mut merged = local.clone();
    for sample in &remote.confidence_samples {
        if !merged.confidence_samples.contains(sample) {
            merged.confidence_samples.push(*sample);
        }
    }
    merged.remote_modified_at = local.remote_modified_at.max(remote.remote_modified_at);
    merged
}
