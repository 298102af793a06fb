//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::Value;

use serene_core::Measurement;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a single measurement
    pub fn print_measurement(&self, m: &Measurement) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:        {}", m.key().record_name());
                println!("Captured:  {}", m.timestamp.format("%Y-%m-%d %H:%M:%S"));
                println!(
                    "Stress:    {:.1} ({})",
                    m.stress_level,
                    m.category()
                );
                println!("HRV:       {:.1} ms", m.hrv);
                println!("Resting:   {:.0} bpm", m.resting_heart_rate);
                if !m.confidence_samples.is_empty() {
                    println!("Confidence: {}", format_samples(&m.confidence_samples));
                }
                if m.is_deleted {
                    println!("Deleted:   yes");
                }
            }
            OutputFormat::Json => {
                println!("{}", pretty(&measurement_json(m)));
            }
            OutputFormat::Quiet => {
                println!("{}", m.key().record_name());
            }
        }
    }

    /// Print a list of measurements
    pub fn print_measurements(&self, measurements: &[Measurement]) {
        match self.format {
            OutputFormat::Human => {
                if measurements.is_empty() {
                    println!("No measurements found.");
                    return;
                }
                for m in measurements {
                    let deleted = if m.is_deleted { " [deleted]" } else { "" };
                    println!(
                        "{} | {:>5.1} {:<8} | hrv {:>5.1} | rhr {:>3.0} | {}{}",
                        m.timestamp.format("%Y-%m-%d %H:%M"),
                        m.stress_level,
                        m.category().as_str(),
                        m.hrv,
                        m.resting_heart_rate,
                        truncate(&m.key().record_name(), 30),
                        deleted
                    );
                }
                println!("\n{} measurement(s)", measurements.len());
            }
            OutputFormat::Json => {
                let list: Vec<Value> = measurements.iter().map(measurement_json).collect();
                println!("{}", pretty(&Value::Array(list)));
            }
            OutputFormat::Quiet => {
                for m in measurements {
                    println!("{}", m.key().record_name());
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// JSON view of a measurement, including its derived category
pub fn measurement_json(m: &Measurement) -> Value {
    serde_json::json!({
        "id": m.key().record_name(),
        "timestamp": m.timestamp,
        "stress_level": m.stress_level,
        "category": m.category().as_str(),
        "hrv": m.hrv,
        "resting_heart_rate": m.resting_heart_rate,
        "confidence_samples": m.confidence_samples,
        "device_id": m.device_id,
        "is_deleted": m.is_deleted,
        "remote_modified_at": m.remote_modified_at,
    })
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn format_samples(samples: &[f64]) -> String {
    samples
        .iter()
        .map(|s| format!("{:.2}", s))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
