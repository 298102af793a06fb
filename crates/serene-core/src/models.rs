//! Data models for Serene
//!
//! Defines the records that travel between devices: stress measurements
//! and the per-account physiological baseline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound of the "relaxed" band (exclusive)
pub const RELAXED_UPPER: f64 = 25.0;
/// Upper bound of the "mild" band (exclusive)
pub const MILD_UPPER: f64 = 50.0;
/// Upper bound of the "moderate" band (exclusive)
pub const MODERATE_UPPER: f64 = 75.0;

/// Stress category derived from a stress level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StressCategory {
    Relaxed,
    Mild,
    Moderate,
    High,
}

impl StressCategory {
    /// Derive the category for a stress level in [0, 100]
    pub fn from_level(level: f64) -> Self {
        if level < RELAXED_UPPER {
            StressCategory::Relaxed
        } else if level < MILD_UPPER {
            StressCategory::Mild
        } else if level < MODERATE_UPPER {
            StressCategory::Moderate
        } else {
            StressCategory::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StressCategory::Relaxed => "relaxed",
            StressCategory::Mild => "mild",
            StressCategory::Moderate => "moderate",
            StressCategory::High => "high",
        }
    }

    /// Parse a wire category name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relaxed" => Some(StressCategory::Relaxed),
            "mild" => Some(StressCategory::Mild),
            "moderate" => Some(StressCategory::Moderate),
            "high" => Some(StressCategory::High),
            _ => None,
        }
    }
}

impl fmt::Display for StressCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical identity of a measurement for sync purposes
///
/// Measurements carry no stable global ID, so two versions of the same
/// measurement are matched by capture time (millisecond precision) and
/// originating device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub timestamp_ms: i64,
    pub device_id: String,
}

impl RecordKey {
    pub fn new(timestamp: DateTime<Utc>, device_id: impl Into<String>) -> Self {
        Self {
            timestamp_ms: timestamp.timestamp_millis(),
            device_id: device_id.into(),
        }
    }

    /// Deterministic remote record name for this identity
    pub fn record_name(&self) -> String {
        format!("{}:{}", self.device_id, self.timestamp_ms)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.device_id, self.timestamp_ms)
    }
}

/// An immutable physiological stress snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Stress score in [0, 100]
    pub stress_level: f64,
    /// Heart rate variability (ms)
    pub hrv: f64,
    /// Resting heart rate (bpm)
    pub resting_heart_rate: f64,
    /// Per-sample confidence values in [0, 1]
    #[serde(default)]
    pub confidence_samples: Vec<f64>,
    /// Device that captured the measurement
    pub device_id: String,
    /// Tombstone flag
    #[serde(default)]
    pub is_deleted: bool,
    /// Server-assigned modification time of the last known remote version
    #[serde(default)]
    pub remote_modified_at: Option<DateTime<Utc>>,
}

impl Measurement {
    /// Create a new measurement captured now on the given device
    pub fn new(
        device_id: impl Into<String>,
        stress_level: f64,
        hrv: f64,
        resting_heart_rate: f64,
    ) -> Self {
        Self::at(Utc::now(), device_id, stress_level, hrv, resting_heart_rate)
    }

    /// Create a measurement with an explicit capture time
    pub fn at(
        timestamp: DateTime<Utc>,
        device_id: impl Into<String>,
        stress_level: f64,
        hrv: f64,
        resting_heart_rate: f64,
    ) -> Self {
        Self {
            timestamp,
            stress_level: clamp_level(stress_level),
            hrv,
            resting_heart_rate,
            confidence_samples: Vec::new(),
            device_id: device_id.into(),
            is_deleted: false,
            remote_modified_at: None,
        }
    }

    /// Attach confidence samples (clamped to [0, 1])
    pub fn with_confidences(mut self, samples: impl IntoIterator<Item = f64>) -> Self {
        self.confidence_samples = samples.into_iter().map(clamp_unit).collect();
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.timestamp, self.device_id.clone())
    }

    /// Category derived from the stress level
    pub fn category(&self) -> StressCategory {
        StressCategory::from_level(self.stress_level)
    }

    /// Mark this measurement as logically deleted
    pub fn tombstone(&mut self) {
        self.is_deleted = true;
    }

    /// Whether two versions carry the same scalar payload
    ///
    /// Ignores confidence samples and the remote modification time.
    pub fn same_scalars(&self, other: &Measurement) -> bool {
        self.stress_level == other.stress_level
            && self.hrv == other.hrv
            && self.resting_heart_rate == other.resting_heart_rate
            && self.is_deleted == other.is_deleted
    }

    /// Whether two versions carry the same payload
    pub fn same_payload(&self, other: &Measurement) -> bool {
        self.same_scalars(other) && self.confidence_samples == other.confidence_samples
    }
}

/// Per-account physiological baseline
///
/// Overwritten wholesale on update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    pub resting_heart_rate: f64,
    pub baseline_hrv: f64,
    pub last_updated: DateTime<Utc>,
}

impl Baseline {
    pub fn new(resting_heart_rate: f64, baseline_hrv: f64) -> Self {
        Self {
            resting_heart_rate,
            baseline_hrv,
            last_updated: Utc::now(),
        }
    }
}

pub(crate) fn clamp_level(level: f64) -> f64 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 100.0)
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_category_thresholds() {
        assert_eq!(StressCategory::from_level(0.0), StressCategory::Relaxed);
        assert_eq!(StressCategory::from_level(24.9), StressCategory::Relaxed);
        assert_eq!(StressCategory::from_level(25.0), StressCategory::Mild);
        assert_eq!(StressCategory::from_level(49.9), StressCategory::Mild);
        assert_eq!(StressCategory::from_level(50.0), StressCategory::Moderate);
        assert_eq!(StressCategory::from_level(74.9), StressCategory::Moderate);
        assert_eq!(StressCategory::from_level(75.0), StressCategory::High);
        assert_eq!(StressCategory::from_level(100.0), StressCategory::High);
    }

    #[test]
    fn test_category_tracks_level() {
        let mut m = Measurement::new("device-a", 10.0, 60.0, 58.0);
        assert_eq!(m.category(), StressCategory::Relaxed);

        m.stress_level = 80.0;
        assert_eq!(m.category(), StressCategory::High);
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(Measurement::new("d", 140.0, 1.0, 1.0).stress_level, 100.0);
        assert_eq!(Measurement::new("d", -3.0, 1.0, 1.0).stress_level, 0.0);
        assert_eq!(Measurement::new("d", f64::NAN, 1.0, 1.0).stress_level, 0.0);
    }

    #[test]
    fn test_confidences_are_clamped() {
        let m = Measurement::new("d", 10.0, 1.0, 1.0).with_confidences([0.5, 1.4, -0.2]);
        assert_eq!(m.confidence_samples, vec![0.5, 1.0, 0.0]);
    }

    #[test]
    fn test_key_and_record_name() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let m = Measurement::at(ts, "watch-abc", 40.0, 50.0, 60.0);

        let key = m.key();
        assert_eq!(key.timestamp_ms, 1_700_000_000_123);
        assert_eq!(key.device_id, "watch-abc");
        assert_eq!(key.record_name(), "watch-abc:1700000000123");
    }

    #[test]
    fn test_tombstone() {
        let mut m = Measurement::new("d", 10.0, 1.0, 1.0);
        assert!(!m.is_deleted);
        m.tombstone();
        assert!(m.is_deleted);
    }

    #[test]
    fn test_category_parse_roundtrip() {
        for c in [
            StressCategory::Relaxed,
            StressCategory::Mild,
            StressCategory::Moderate,
            StressCategory::High,
        ] {
            assert_eq!(StressCategory::parse(c.as_str()), Some(c));
        }
        assert_eq!(StressCategory::parse("panic"), None);
    }
}
