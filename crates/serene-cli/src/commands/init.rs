//! Init and device command handlers

use anyhow::Result;

use serene_core::identity::{self, DeviceClass};
use serene_core::Config;

use crate::commands::require_identity;
use crate::output::{Output, OutputFormat};

/// Create this device's identity, or report the existing one
pub fn init(config: &Config, companion: bool, output: &Output) -> Result<()> {
    let class = if companion {
        DeviceClass::Companion
    } else {
        config.device_class
    };

    let result = identity::initialize(&config.device_id_path(), class)?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "device_id": result.identity.id(),
                    "device_class": result.identity.class().as_str(),
                    "is_new": result.is_new
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", result.identity);
        }
        OutputFormat::Human => {
            println!();
            if result.is_new {
                println!("Created new {} device.", result.identity.class());
            } else {
                println!("Already initialized.");
            }
            println!("Device ID: {}", result.identity);
            println!();
            println!("This ID is stored in: {}", result.path.display());
            if !result.is_new && result.identity.class() != class {
                println!(
                    "Note: existing device is {}; remove the file above to start fresh.",
                    result.identity.class()
                );
            }
            if config.remote_dir.is_none() {
                println!();
                println!("Remote store not configured. Your data will sync once you set one:");
                println!("  serene config set remote_dir /path/to/shared/dir");
                println!("  serene config set sync_enabled true");
            }
        }
    }

    Ok(())
}

/// Show this device's identity
pub fn show_device(config: &Config, output: &Output) -> Result<()> {
    let identity = require_identity(config)?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "device_id": identity.id(),
                    "device_class": identity.class().as_str()
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", identity);
        }
        OutputFormat::Human => {
            println!();
            println!("Device ID:    {}", identity);
            println!("Device class: {}", identity.class());
        }
    }

    Ok(())
}
