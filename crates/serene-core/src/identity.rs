//! Device identity management
//!
//! Each installation owns a device identifier generated once and persisted
//! in the data directory. Companion devices carry a fixed prefix so any
//! peer can tell the device class from the identifier alone.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persist::atomic_write;

/// Identifier prefix for companion (watch) devices
pub const COMPANION_PREFIX: &str = "watch-";

/// Class of device participating in sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Phone: large batches, no throttle
    #[default]
    Primary,
    /// Watch: small batches, throttled automatic syncs
    Companion,
}

impl DeviceClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "phone" => Some(DeviceClass::Primary),
            "companion" | "watch" => Some(DeviceClass::Companion),
            _ => None,
        }
    }

    /// Infer the class from a device identifier
    pub fn of_device_id(device_id: &str) -> Self {
        if device_id.starts_with(COMPANION_PREFIX) {
            DeviceClass::Companion
        } else {
            DeviceClass::Primary
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Primary => "primary",
            DeviceClass::Companion => "companion",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent identity of this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
    class: DeviceClass,
}

impl DeviceIdentity {
    /// Generate a fresh identity for the given class
    pub fn generate(class: DeviceClass) -> Self {
        let uuid = Uuid::new_v4();
        let id = match class {
            DeviceClass::Primary => uuid.to_string(),
            DeviceClass::Companion => format!("{}{}", COMPANION_PREFIX, uuid),
        };
        Self { id, class }
    }

    /// Wrap an existing identifier; the class is inferred from its prefix
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let class = DeviceClass::of_device_id(&id);
        Self { id, class }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn is_companion(&self) -> bool {
        self.class == DeviceClass::Companion
    }

    /// Load the identity stored at `path`
    ///
    /// Returns `None` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read device id from {:?}", path))?;
        let id = content.trim();
        if id.is_empty() {
            anyhow::bail!("Device id file {:?} is empty", path);
        }

        Ok(Some(Self::from_id(id)))
    }

    /// Persist the identity to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, self.id.as_bytes())
            .with_context(|| format!("Failed to save device id to {:?}", path))
    }

    /// Load the stored identity or generate and persist a new one
    ///
    /// An existing identity is never regenerated, even if `class` differs:
    /// device ids are immutable once records reference them.
    pub fn load_or_create(path: &Path, class: DeviceClass) -> Result<Self> {
        if let Some(identity) = Self::load(path)? {
            if identity.class != class {
                tracing::warn!(
                    "Stored device id {} is {}, configured class is {}",
                    identity.id,
                    identity.class,
                    class
                );
            }
            return Ok(identity);
        }

        let identity = Self::generate(class);
        identity.save(path)?;
        tracing::info!("Generated new {} device id {}", class, identity.id);
        Ok(identity)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Result of first-time initialization
#[derive(Debug)]
pub struct InitResult {
    pub identity: DeviceIdentity,
    pub path: PathBuf,
    /// Whether a new identity was created (vs. an existing one found)
    pub is_new: bool,
}

/// Initialize a device identity at `path`, refusing to overwrite one
pub fn initialize(path: &Path, class: DeviceClass) -> Result<InitResult> {
    if let Some(identity) = DeviceIdentity::load(path)? {
        return Ok(InitResult {
            identity,
            path: path.to_path_buf(),
            is_new: false,
        });
    }

    let identity = DeviceIdentity::generate(class);
    identity.save(path)?;
    Ok(InitResult {
        identity,
        path: path.to_path_buf(),
        is_new: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_primary_and_companion() {
        let phone = DeviceIdentity::generate(DeviceClass::Primary);
        assert!(!phone.id().starts_with(COMPANION_PREFIX));
        assert!(!phone.is_companion());

        let watch = DeviceIdentity::generate(DeviceClass::Companion);
        assert!(watch.id().starts_with(COMPANION_PREFIX));
        assert!(watch.is_companion());
    }

    #[test]
    fn test_class_inferred_from_id() {
        assert_eq!(
            DeviceIdentity::from_id("watch-1234").class(),
            DeviceClass::Companion
        );
        assert_eq!(
            DeviceIdentity::from_id("5f2c-aa").class(),
            DeviceClass::Primary
        );
    }

    #[test]
    fn test_load_or_create_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("device_id");

        let first = DeviceIdentity::load_or_create(&path, DeviceClass::Companion).unwrap();
        let second = DeviceIdentity::load_or_create(&path, DeviceClass::Companion).unwrap();

        assert_eq!(first, second);
        assert!(first.is_companion());
    }

    #[test]
    fn test_existing_id_is_not_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("device_id");

        let original = DeviceIdentity::load_or_create(&path, DeviceClass::Primary).unwrap();
        let reloaded = DeviceIdentity::load_or_create(&path, DeviceClass::Companion).unwrap();

        assert_eq!(original.id(), reloaded.id());
        assert_eq!(reloaded.class(), DeviceClass::Primary);
    }

    #[test]
    fn test_empty_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("device_id");
        fs::write(&path, "  \n").unwrap();

        assert!(DeviceIdentity::load(&path).is_err());
    }

    #[test]
    fn test_initialize_reports_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("device_id");

        let first = initialize(&path, DeviceClass::Primary).unwrap();
        assert!(first.is_new);

        let second = initialize(&path, DeviceClass::Primary).unwrap();
        assert!(!second.is_new);
        assert_eq!(first.identity, second.identity);
    }

    #[test]
    fn test_parse_device_class() {
        assert_eq!(DeviceClass::parse("Primary"), Some(DeviceClass::Primary));
        assert_eq!(DeviceClass::parse("watch"), Some(DeviceClass::Companion));
        assert_eq!(DeviceClass::parse("tablet"), None);
    }
}
