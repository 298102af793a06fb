//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use serene_core::identity::DeviceClass;
use serene_core::sync::StrategyKind;
use serene_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, remote_dir, sync_enabled, device_class, conflict_strategy, \
                          priority_device, log_file, batch_size, throttle_secs, max_retries, \
                          base_delay_ms";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "remote_dir": config.remote_dir,
                    "sync_enabled": config.sync_enabled,
                    "device_class": config.device_class.as_str(),
                    "conflict_strategy": config.conflict_strategy.as_str(),
                    "priority_device": config.priority_device.as_str(),
                    "log_file": config.log_file,
                    "sync": {
                        "batch_size": config.sync.batch_size,
                        "throttle_secs": config.sync.throttle_secs,
                        "max_retries": config.sync.max_retries,
                        "base_delay_ms": config.sync.base_delay_ms
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:          {}", config.data_dir.display());
            println!("  remote_dir:        {}", display_path(&config.remote_dir));
            println!("  sync_enabled:      {}", config.sync_enabled);
            println!("  device_class:      {}", config.device_class);
            println!("  conflict_strategy: {}", config.conflict_strategy);
            println!("  priority_device:   {}", config.priority_device);
            println!("  log_file:          {}", display_path(&config.log_file));
            println!("  batch_size:        {}", display_opt(config.sync.batch_size));
            println!("  throttle_secs:     {}", display_opt(config.sync.throttle_secs));
            println!("  max_retries:       {}", display_opt(config.sync.max_retries));
            println!("  base_delay_ms:     {}", display_opt(config.sync.base_delay_ms));
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "remote_dir" => {
            config.remote_dir = optional(value).map(PathBuf::from);
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "device_class" => {
            config.device_class = parse_class(key, value)?;
        }
        "priority_device" => {
            config.priority_device = parse_class(key, value)?;
        }
        "conflict_strategy" => {
            config.conflict_strategy = StrategyKind::parse(value).with_context(|| {
                format!(
                    "Invalid value for conflict_strategy: '{}'. \
                     Use timestamp, device_priority, server or client.",
                    value
                )
            })?;
        }
        "log_file" => {
            config.log_file = optional(value).map(PathBuf::from);
        }
        "batch_size" => {
            config.sync.batch_size = parse_number(key, value)?;
        }
        "throttle_secs" => {
            config.sync.throttle_secs = parse_number(key, value)?;
        }
        "max_retries" => {
            config.sync.max_retries = parse_number(key, value)?;
        }
        "base_delay_ms" => {
            config.sync.base_delay_ms = parse_number(key, value)?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

/// Empty or "none" clears an optional value
fn optional(value: &str) -> Option<&str> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value)
    }
}

fn parse_class(key: &str, value: &str) -> Result<DeviceClass> {
    DeviceClass::parse(value).with_context(|| {
        format!(
            "Invalid value for {}: '{}'. Use 'primary' or 'companion'.",
            key, value
        )
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<Option<T>> {
    match optional(value) {
        None => Ok(None),
        Some(v) => match v.parse() {
            Ok(n) => Ok(Some(n)),
            Err(_) => bail!("Invalid value for {}: '{}'. Expected a number.", key, value),
        },
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "(default)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();

        apply(&mut config, "remote_dir", "/tmp/shared").unwrap();
        apply(&mut config, "sync_enabled", "true").unwrap();
        apply(&mut config, "device_class", "watch").unwrap();
        apply(&mut config, "conflict_strategy", "device-priority").unwrap();
        apply(&mut config, "batch_size", "4").unwrap();
        apply(&mut config, "throttle_secs", "0").unwrap();

        assert_eq!(config.remote_dir, Some(PathBuf::from("/tmp/shared")));
        assert!(config.sync_enabled);
        assert_eq!(config.device_class, DeviceClass::Companion);
        assert_eq!(config.conflict_strategy, StrategyKind::DevicePriority);
        assert_eq!(config.sync.batch_size, Some(4));
        assert_eq!(config.sync.throttle_secs, Some(0));

        apply(&mut config, "remote_dir", "none").unwrap();
        apply(&mut config, "batch_size", "").unwrap();
        assert_eq!(config.remote_dir, None);
        assert_eq!(config.sync.batch_size, None);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();

        assert!(apply(&mut config, "sync_enabled", "maybe").is_err());
        assert!(apply(&mut config, "device_class", "tablet").is_err());
        assert!(apply(&mut config, "conflict_strategy", "newest").is_err());
        assert!(apply(&mut config, "max_retries", "three").is_err());

        let err = apply(&mut config, "favorite_tag", "x").unwrap_err();
        assert!(err.to_string().contains("Valid keys"));
    }

    #[test]
    fn test_set_writes_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let data_dir = temp_dir.path().join("data");
        std::fs::write(
            &config_path,
            format!("data_dir = {:?}\n", data_dir.display().to_string()),
        )
        .unwrap();
        let output = Output::new(OutputFormat::Quiet);

        set(
            "conflict_strategy".to_string(),
            "server".to_string(),
            Some(&config_path),
            &output,
        )
        .unwrap();

        let saved = std::fs::read_to_string(&config_path).unwrap();
        assert!(saved.contains("conflict_strategy = \"server\""));
    }
}
