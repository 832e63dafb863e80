//! # Reading
//!
//! The canonical battery telemetry record published to consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Diagnostic published when a frame fails to decode
pub const PARSE_ERROR: &str = "Parse error";

/// Diagnostic published before the first frame arrives
pub const NO_DATA: &str = "No data received";

/// One normalized telemetry reading
///
/// A reading is either a complete decoded record (`error` is `None`) or a
/// copy of the last good values annotated with a diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Capture time, assigned by the pipeline
    pub timestamp: DateTime<Utc>,
    /// Volts
    pub voltage: f64,
    /// Milliamps
    pub current: f64,
    /// Milliwatts
    pub power: f64,
    /// Degrees Celsius, if the device reports it
    pub temperature: Option<f64>,
    /// Percent, 0-100
    pub state_of_charge: f64,
    /// Percent, 0-100
    pub state_of_health: f64,
    pub cycle_count: u32,
    /// Milliwatt-hours, if the device reports it
    pub energy: Option<f64>,
    /// Link status at capture time
    pub connected: bool,
    pub error: Option<String>,
}

impl Reading {
    /// Placeholder published before any frame has been decoded
    pub fn initial(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            temperature: None,
            state_of_charge: 0.0,
            state_of_health: 0.0,
            cycle_count: 0,
            energy: None,
            connected: false,
            error: Some(NO_DATA.to_string()),
        }
    }

    /// Copy of this reading's values carrying a diagnostic
    ///
    /// The timestamp is kept, since the values still describe that moment.
    pub fn with_error(&self, error: impl Into<String>, connected: bool) -> Self {
        Self {
            connected,
            error: Some(error.into()),
            ..self.clone()
        }
    }

    /// True if this reading came from a successfully decoded frame
    pub fn is_good(&self) -> bool {
        self.error.is_none()
    }
}
