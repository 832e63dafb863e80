//! # Battery Telemetry
//!
//! Ingests battery-monitor telemetry from a serial microcontroller.
//!
//! The binary owns one supervisor task that reads, decodes and logs frames,
//! and periodically prints the latest status as JSON until Ctrl+C.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use battery_telemetry::config::{Config, LoggingConfig};
use battery_telemetry::serial::SerialConnector;
use battery_telemetry::supervisor::Supervisor;

/// Configuration file used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// File name prefix for rolling process logs
const LOG_FILE_PREFIX: &str = "battery-telemetry.log";

/// Main entry point for Battery Telemetry
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/default.toml`)
///    - Set up logging with tracing subscriber
///    - Spawn the ingestion supervisor
///
/// 2. **Main Loop**
///    - Log the current status every `report_interval_ms`
///    - Handle Ctrl+C for graceful shutdown
///
/// 3. **Graceful Shutdown**
///    - Cancel the supervisor and wait for it to release the port
///
/// # Errors
///
/// Returns error if the configuration cannot be loaded or is invalid.
/// A missing or busy serial device is not an error; the supervisor retries.
///
/// # Examples
///
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(std::env::args().nth(1), Path::new(DEFAULT_CONFIG_PATH))?;
    let _log_guard = init_logging(&config.logging);

    info!("Battery Telemetry v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Port {} at {} baud, {:?} frames, nominal full charge {} V",
        config.serial.port,
        config.serial.baud_rate,
        config.frame.format,
        config.battery.nominal_full_charge_voltage
    );

    let supervisor = Supervisor::new(SerialConnector, &config)?;
    let status = supervisor.status_handle();

    let cancel = CancellationToken::new();
    let ingest = tokio::spawn(supervisor.run(cancel.clone()));

    let mut report_interval = interval(Duration::from_millis(config.status.report_interval_ms));
    info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = report_interval.tick() => {
                let report = serde_json::to_string(&status.report())?;
                info!("Status: {}", report);
            }

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    cancel.cancel();
    ingest.await.context("ingestion task panicked")?;

    Ok(())
}

/// Explicit path, else `fallback` if it exists, else built-in defaults
fn load_config(arg: Option<String>, fallback: &Path) -> Result<Config> {
    match arg {
        Some(path) => {
            Config::load(&path).with_context(|| format!("failed to load config from {}", path))
        }
        None if fallback.exists() => Config::load(fallback)
            .with_context(|| format!("failed to load config from {}", fallback.display())),
        None => Ok(Config::default()),
    }
}

/// Install the global subscriber; the returned guard flushes file output on drop
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_no_config_anywhere_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(None, &dir.path().join("default.toml")).unwrap();

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_fallback_config_is_loaded_when_present() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[serial]\nbaud_rate = 115200\n").unwrap();
        file.flush().unwrap();

        let config = load_config(None, file.path()).unwrap();
        assert_eq!(config.serial.baud_rate, 115200);
    }

    #[test]
    fn test_broken_fallback_config_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[serial]\nbaud_rate = 1234\n").unwrap();
        file.flush().unwrap();

        assert!(load_config(None, file.path()).is_err());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = load_config(Some("/nonexistent/battery.toml".to_string()), dir.path());
        assert!(result.is_err());
        assert!(format!("{:#}", result.unwrap_err()).contains("/nonexistent/battery.toml"));
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[serial]\nport = \"/dev/ttyUSB1\"\n").unwrap();
        file.flush().unwrap();

        let config = load_config(
            Some(file.path().to_string_lossy().into_owned()),
            Path::new(DEFAULT_CONFIG_PATH),
        )
        .unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB1");
    }
}
