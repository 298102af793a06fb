//! Atomic file persistence helpers
//!
//! Every file Serene owns (device id, local store, sync cursor, shared
//! remote records) is written with write-to-temp-then-rename so a crash
//! never leaves a partially written file behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Write data atomically (temp file in the same directory, then rename)
///
/// Each call writes its own temp file, so concurrent writers never clobber
/// each other's half-written data.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = temp_path_for(path);
    let written = write_synced(&temp_path, data).and_then(|()| {
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))
    });
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

fn write_synced(temp_path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

    file.write_all(data)
        .with_context(|| format!("Failed to write to temp file {:?}", temp_path))?;

    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {:?}", temp_path))
}

/// `.<name>.<pid>.<uuid>.tmp` next to `path`
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        Uuid::new_v4().simple()
    ))
}

/// Serialize a value as pretty JSON and write it atomically
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    atomic_write(path, &json)
}

/// Read a JSON file, returning `None` when it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value =
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(Some(value))
}
