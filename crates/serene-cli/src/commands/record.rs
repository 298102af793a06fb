//! Measurement command handlers

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use serene_core::{Config, FileStore, Measurement, RecordKey};

use crate::commands::require_identity;
use crate::output::Output;

/// Record a new measurement on this device
pub async fn record(
    config: &Config,
    stress: f64,
    hrv: f64,
    rhr: f64,
    confidence: Vec<f64>,
    at: Option<String>,
    output: &Output,
) -> Result<()> {
    let identity = require_identity(config)?;
    validate(stress, hrv, rhr, &confidence)?;

    let timestamp = match at {
        Some(ref s) => parse_time(s)?,
        None => Utc::now(),
    };

    let measurement =
        Measurement::at(timestamp, identity.id(), stress, hrv, rhr).with_confidences(confidence);

    let store = FileStore::open(config.store_path())?;
    store.insert(measurement.clone()).await?;

    if output.is_quiet() || output.is_json() {
        output.print_measurement(&measurement);
    } else {
        output.success(&format!(
            "Recorded {} stress ({:.1}) as {}",
            measurement.category(),
            measurement.stress_level,
            measurement.key().record_name()
        ));
    }

    Ok(())
}

/// List measurements, newest first
pub async fn list(config: &Config, all: bool, limit: Option<usize>, output: &Output) -> Result<()> {
    let store = FileStore::open(config.store_path())?;
    let mut measurements = store.all(all).await?;
    if let Some(limit) = limit {
        measurements.truncate(limit);
    }

    output.print_measurements(&measurements);
    Ok(())
}

/// Delete a measurement (tombstoned until the deletion syncs)
pub async fn delete(config: &Config, id: String, output: &Output) -> Result<()> {
    let identity = require_identity(config)?;
    let key = parse_record_id(&id, identity.id())?;

    let store = FileStore::open(config.store_path())?;
    if !store.tombstone(&key).await? {
        bail!("Measurement not found: {}", id);
    }

    output.success(&format!("Deleted measurement {}", key.record_name()));
    Ok(())
}

fn validate(stress: f64, hrv: f64, rhr: f64, confidence: &[f64]) -> Result<()> {
    if !(0.0..=100.0).contains(&stress) {
        bail!("Stress level must be between 0 and 100, got {}", stress);
    }
    if !hrv.is_finite() || hrv < 0.0 {
        bail!("HRV must be a non-negative number, got {}", hrv);
    }
    if !rhr.is_finite() || rhr <= 0.0 {
        bail!("Resting heart rate must be positive, got {}", rhr);
    }
    if let Some(bad) = confidence.iter().find(|c| !(0.0..=1.0).contains(*c)) {
        bail!("Confidence values must be between 0 and 1, got {}", bad);
    }
    Ok(())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid capture time '{}'. Use RFC 3339, e.g. 2024-03-01T09:00:00Z", s))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Parse `device:millis`, or bare `millis` for this device
fn parse_record_id(id: &str, own_device: &str) -> Result<RecordKey> {
    let (device_id, millis) = match id.rsplit_once(':') {
        Some((device, millis)) if !device.is_empty() => (device.to_string(), millis),
        _ => (own_device.to_string(), id),
    };

    let timestamp_ms = millis
        .trim()
        .parse::<i64>()
        .with_context(|| format!("Invalid measurement ID '{}'. Use device:millis", id))?;

    Ok(RecordKey {
        timestamp_ms,
        device_id,
    })
}
