//! Command handlers

pub mod config;
pub mod init;
pub mod record;
pub mod status;
pub mod sync;

use anyhow::{bail, Result};

use serene_core::{Config, DeviceIdentity};

/// Load this device's identity, failing with a hint when not initialized
pub(crate) fn require_identity(config: &Config) -> Result<DeviceIdentity> {
    match DeviceIdentity::load(&config.device_id_path())? {
        Some(identity) => Ok(identity),
        None => bail!("Not initialized. Run `serene init` first."),
    }
}
