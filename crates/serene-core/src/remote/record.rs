//! Wire record codec
//!
//! Maps measurements and baselines to and from the backend's generic
//! record format. Pure: no I/O.
//!
//! Record type names are shared by every device on the account and must
//! not change without a migration path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::error::RemoteError;
use crate::models::{clamp_level, clamp_unit, Baseline, Measurement, RecordKey, StressCategory};

/// Record type of a stress measurement
pub const MEASUREMENT_RECORD_TYPE: &str = "StressMeasurement";
/// Record type of the account baseline
pub const BASELINE_RECORD_TYPE: &str = "PersonalBaseline";
/// The single baseline record's name
pub const BASELINE_RECORD_NAME: &str = "baseline";

/// Wire field names
pub mod fields {
    pub const TIMESTAMP: &str = "timestamp";
    pub const STRESS_LEVEL: &str = "stressLevel";
    pub const HRV: &str = "hrv";
    pub const RESTING_HEART_RATE: &str = "restingHeartRate";
    pub const CATEGORY: &str = "category";
    pub const CONFIDENCES: &str = "confidences";
    pub const DEVICE_ID: &str = "deviceID";
    pub const IS_DELETED: &str = "isDeleted";
    pub const CLOUD_MOD_TIME: &str = "cloudModTime";
    pub const BASELINE_HRV: &str = "baselineHRV";
    pub const LAST_UPDATED: &str = "lastUpdated";
}

/// A typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Double(f64),
    String(String),
    Bool(bool),
    Date(DateTime<Utc>),
    DoubleList(Vec<f64>),
}

/// A record as stored by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record_type: String,
    /// Backend-unique name of the record
    pub record_name: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Server-assigned modification time, set by the backend on save
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl RemoteRecord {
    pub fn new(record_type: impl Into<String>, record_name: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            record_name: record_name.into(),
            fields: BTreeMap::new(),
            modified_at: None,
        }
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Stamp the server modification time (backend use)
    pub fn stamp(&mut self, at: DateTime<Utc>) {
        self.modified_at = Some(at);
        self.set(fields::CLOUD_MOD_TIME, FieldValue::Date(at));
    }

    fn double(&self, name: &'static str) -> Result<f64, CodecError> {
        match self.get(name) {
            Some(FieldValue::Double(v)) => Ok(*v),
            Some(_) => Err(CodecError::WrongType {
                field: name,
                expected: "double",
            }),
            None => Err(CodecError::MissingField(name)),
        }
    }

    fn date(&self, name: &'static str) -> Result<DateTime<Utc>, CodecError> {
        match self.get(name) {
            Some(FieldValue::Date(v)) => Ok(*v),
            Some(_) => Err(CodecError::WrongType {
                field: name,
                expected: "date",
            }),
            None => Err(CodecError::MissingField(name)),
        }
    }

    fn string(&self, name: &'static str) -> Result<&str, CodecError> {
        match self.get(name) {
            Some(FieldValue::String(v)) => Ok(v),
            Some(_) => Err(CodecError::WrongType {
                field: name,
                expected: "string",
            }),
            None => Err(CodecError::MissingField(name)),
        }
    }

    fn check_type(&self, expected: &'static str) -> Result<(), CodecError> {
        if self.record_type == expected {
            Ok(())
        } else {
            Err(CodecError::WrongRecordType {
                expected,
                found: self.record_type.clone(),
            })
        }
    }
}

/// Errors decoding a wire record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("expected record type {expected}, found {found}")]
    WrongRecordType {
        expected: &'static str,
        found: String,
    },

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is not a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

impl From<CodecError> for RemoteError {
    fn from(err: CodecError) -> Self {
        RemoteError::Unknown(format!("malformed record: {}", err))
    }
}

/// Encode a measurement as a wire record
///
/// The record name is derived from the measurement's logical identity, so
/// saving the same measurement twice updates one record.
pub fn encode_measurement(m: &Measurement) -> RemoteRecord {
    let mut record = RemoteRecord::new(MEASUREMENT_RECORD_TYPE, m.key().record_name());
    record.set(fields::TIMESTAMP, FieldValue::Date(m.timestamp));
    record.set(fields::STRESS_LEVEL, FieldValue::Double(m.stress_level));
    record.set(fields::HRV, FieldValue::Double(m.hrv));
    record.set(
        fields::RESTING_HEART_RATE,
        FieldValue::Double(m.resting_heart_rate),
    );
    record.set(
        fields::CATEGORY,
        FieldValue::String(m.category().as_str().to_string()),
    );
    record.set(
        fields::CONFIDENCES,
        FieldValue::DoubleList(m.confidence_samples.clone()),
    );
    record.set(fields::DEVICE_ID, FieldValue::String(m.device_id.clone()));
    record.set(fields::IS_DELETED, FieldValue::Bool(m.is_deleted));
    record
}

/// Decode a wire record into a measurement
pub fn decode_measurement(record: &RemoteRecord) -> Result<Measurement, CodecError> {
    record.check_type(MEASUREMENT_RECORD_TYPE)?;

    let timestamp = record.date(fields::TIMESTAMP)?;
    let stress_level = clamp_level(record.double(fields::STRESS_LEVEL)?);
    let hrv = record.double(fields::HRV)?;
    let resting_heart_rate = record.double(fields::RESTING_HEART_RATE)?;
    let device_id = record.string(fields::DEVICE_ID)?.to_string();

    let confidence_samples = match record.get(fields::CONFIDENCES) {
        Some(FieldValue::DoubleList(values)) => values.iter().copied().map(clamp_unit).collect(),
        Some(_) => {
            return Err(CodecError::WrongType {
                field: fields::CONFIDENCES,
                expected: "double list",
            })
        }
        None => Vec::new(),
    };

    let is_deleted = matches!(record.get(fields::IS_DELETED), Some(FieldValue::Bool(true)));

    let remote_modified_at = match record.get(fields::CLOUD_MOD_TIME) {
        Some(FieldValue::Date(at)) => Some(*at),
        _ => record.modified_at,
    };

    // Category is always derived locally; a stale wire value is only logged
    let derived = StressCategory::from_level(stress_level);
    if let Some(FieldValue::String(wire)) = record.get(fields::CATEGORY) {
        if StressCategory::parse(wire) != Some(derived) {
            warn!(
                "Record {} has category '{}', recomputed as '{}'",
                record.record_name, wire, derived
            );
        }
    }

    Ok(Measurement {
        timestamp,
        stress_level,
        hrv,
        resting_heart_rate,
        confidence_samples,
        device_id,
        is_deleted,
        remote_modified_at,
    })
}

/// Identity of the measurement a record encodes, without a full decode
pub fn record_key(record: &RemoteRecord) -> Result<RecordKey, CodecError> {
    let timestamp = record.date(fields::TIMESTAMP)?;
    let device_id = record.string(fields::DEVICE_ID)?;
    Ok(RecordKey::new(timestamp, device_id))
}

/// Encode the account baseline
pub fn encode_baseline(b: &Baseline) -> RemoteRecord {
    let mut record = RemoteRecord::new(BASELINE_RECORD_TYPE, BASELINE_RECORD_NAME);
    record.set(
        fields::RESTING_HEART_RATE,
        FieldValue::Double(b.resting_heart_rate),
    );
    record.set(fields::BASELINE_HRV, FieldValue::Double(b.baseline_hrv));
    record.set(fields::LAST_UPDATED, FieldValue::Date(b.last_updated));
    record
}

/// Decode the account baseline
pub fn decode_baseline(record: &RemoteRecord) -> Result<Baseline, CodecError> {
    record.check_type(BASELINE_RECORD_TYPE)?;
    Ok(Baseline {
        resting_heart_rate: record.double(fields::RESTING_HEART_RATE)?,
        baseline_hrv: record.double(fields::BASELINE_HRV)?,
        last_updated: record.date(fields::LAST_UPDATED)?,
    })
}
