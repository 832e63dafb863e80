//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, TelemetryError};
use crate::frame::{Field, FrameLayout, WireFormat};
use crate::telemetry::CurrentSign;

/// Baud rates accepted for the battery monitor link
pub const SUPPORTED_BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115200];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Device path, or `"auto"` to try every available port
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Per-read timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Wait after opening, while the board reboots
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Reads spent looking for a valid frame after opening (0 disables)
    #[serde(default = "default_validation_lines")]
    pub validation_lines: u32,
}

/// Wire format configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FrameConfig {
    #[serde(default = "default_wire_format")]
    pub format: WireFormat,

    /// Field order, used only when `format = "custom"`
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// Battery model configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BatteryConfig {
    #[serde(default = "default_nominal_full_charge_voltage")]
    pub nominal_full_charge_voltage: f64,

    #[serde(default)]
    pub current_sign: CurrentSign,
}

/// Reading log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_path")]
    pub path: String,
}

/// Process log configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; stdout when unset
    #[serde(default)]
    pub dir: Option<String>,
}

/// Status output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud_rate() -> u32 { 9600 }
fn default_timeout_ms() -> u64 { 1000 }
fn default_reconnect_interval_ms() -> u64 { 5000 }
fn default_settle_ms() -> u64 { 2000 }
fn default_validation_lines() -> u32 { 5 }

fn default_wire_format() -> WireFormat { WireFormat::Compact }

fn default_nominal_full_charge_voltage() -> f64 { 4.2 }

fn default_log_enabled() -> bool { true }
fn default_log_path() -> String { "./logs/battery_log.csv".to_string() }

fn default_report_interval_ms() -> u64 { 10000 }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            settle_ms: default_settle_ms(),
            validation_lines: default_validation_lines(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            format: default_wire_format(),
            fields: Vec::new(),
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            nominal_full_charge_voltage: default_nominal_full_charge_voltage(),
            current_sign: CurrentSign::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            path: default_log_path(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

impl FrameConfig {
    /// Resolve the configured format into a validated layout
    pub fn layout(&self) -> Result<FrameLayout> {
        FrameLayout::from_format(self.format, &self.fields)
    }
}

fn invalid(msg: impl Into<String>) -> TelemetryError {
    TelemetryError::InvalidConfig(msg.into())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use battery_telemetry::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if any value is out of its valid range
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(invalid(format!(
                "baud_rate must be one of: {:?}",
                SUPPORTED_BAUD_RATES
            )));
        }

        // Validate timing fields
        if self.serial.timeout_ms == 0 || self.serial.timeout_ms > 10000 {
            return Err(invalid("timeout_ms must be between 1 and 10000"));
        }

        if self.serial.reconnect_interval_ms == 0 || self.serial.reconnect_interval_ms > 60000 {
            return Err(invalid("reconnect_interval_ms must be between 1 and 60000"));
        }

        if self.serial.settle_ms > 10000 {
            return Err(invalid("settle_ms must be between 0 and 10000"));
        }

        if self.serial.validation_lines > 100 {
            return Err(invalid("validation_lines must be between 0 and 100"));
        }

        // Resolving the layout checks arity, duplicates and required fields
        self.frame.layout()?;

        if !self.frame.fields.is_empty() && self.frame.format != WireFormat::Custom {
            return Err(invalid("frame fields may only be set when format = \"custom\""));
        }

        let nominal = self.battery.nominal_full_charge_voltage;
        if !nominal.is_finite() || nominal <= 0.0 {
            return Err(invalid("nominal_full_charge_voltage must be greater than 0"));
        }

        if self.log.enabled && self.log.path.is_empty() {
            return Err(invalid("log path cannot be empty when enabled"));
        }

        if matches!(&self.logging.dir, Some(dir) if dir.is_empty()) {
            return Err(invalid("logging dir cannot be empty when set"));
        }

        if self.status.report_interval_ms < 100 || self.status.report_interval_ms > 600000 {
            return Err(invalid("report_interval_ms must be between 100 and 600000"));
        }

        Ok(())
    }
}
