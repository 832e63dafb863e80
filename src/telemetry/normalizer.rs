//! # Reading Normalizer
//!
//! Maps a decoded frame onto the canonical [`Reading`], deriving what the wire
//! layout leaves out.
//!
//! ## Derivations
//!
//! - `power = voltage * current` when the layout has no power field
//! - `state_of_health = voltage / nominal_full_charge_voltage * 100`, clamped
//!   to 0-100, when the layout has no state-of-health field
//! - temperature, cycle count and energy carry forward from the previous
//!   reading when the layout has no such field
//!
//! All arithmetic runs at full precision; values are rounded to
//! [`DECIMAL_PLACES`] only when the reading is built.
//!
//! Derived power therefore matches the published voltage and current only
//! to within the rounding of its inputs:
//!
//! ```text
//! |power - voltage * current| <= 0.005 * (|voltage| + |current| + 1)
//! ```
//!
//! With inputs of at most two decimals that is below 0.01. For `3.705,1200,50`
//! the reading carries power 4446 against 3.71 * 1200 = 4452.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::reading::Reading;
use crate::frame::{Field, RawFrame};

/// Precision of every numeric field in a published reading
pub const DECIMAL_PLACES: i32 = 2;

/// How the device's current sign maps onto the reading
///
/// Firmware variants disagree on whether positive current means charging or
/// discharging, so this is left to configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentSign {
    /// Keep the sign the device reports
    #[default]
    AsReported,
    /// Negate current and power
    Inverted,
}

impl CurrentSign {
    fn factor(self) -> f64 {
        match self {
            CurrentSign::AsReported => 1.0,
            CurrentSign::Inverted => -1.0,
        }
    }
}

/// Pure frame-to-reading mapping
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    nominal_full_charge_voltage: f64,
    current_sign: CurrentSign,
}

impl Normalizer {
    pub fn new(nominal_full_charge_voltage: f64, current_sign: CurrentSign) -> Self {
        Self {
            nominal_full_charge_voltage,
            current_sign,
        }
    }

    /// Normalize `frame`, stamping it with the current time
    pub fn normalize(&self, frame: &RawFrame, previous: &Reading) -> Reading {
        self.normalize_at(frame, previous, Utc::now())
    }

    /// Normalize `frame` with an explicit capture time
    ///
    /// # Examples
    ///
    /// ```
    /// use battery_telemetry::frame::{FrameDecoder, FrameLayout};
    /// use battery_telemetry::telemetry::{CurrentSign, Normalizer, Reading};
    /// use chrono::Utc;
    ///
    /// let frame = FrameDecoder::new(FrameLayout::compact())
    ///     .decode(b"3.90,120.0,3,\n")
    ///     .unwrap();
    /// let now = Utc::now();
    /// let reading = Normalizer::new(4.2, CurrentSign::AsReported)
    ///     .normalize_at(&frame, &Reading::initial(now), now);
    ///
    /// assert_eq!(reading.power, 468.0);
    /// assert_eq!(reading.state_of_health, 92.86);
    /// ```
    pub fn normalize_at(
        &self,
        frame: &RawFrame,
        previous: &Reading,
        timestamp: DateTime<Utc>,
    ) -> Reading {
        let sign = self.current_sign.factor();

        // The decoder guarantees voltage, current and state of charge
        let voltage = frame.get(Field::Voltage).unwrap_or(previous.voltage);
        let current = frame.get(Field::Current).unwrap_or(previous.current) * sign;
        let state_of_charge = frame
            .get(Field::StateOfCharge)
            .unwrap_or(previous.state_of_charge);

        let power = match frame.get(Field::Power) {
            Some(power) => power * sign,
            None => voltage * current,
        };

        let state_of_health = frame
            .get(Field::StateOfHealth)
            .unwrap_or_else(|| self.derive_state_of_health(voltage));

        let cycle_count = frame
            .get(Field::CycleCount)
            .map(|c| c.trunc() as u32)
            .unwrap_or(previous.cycle_count);

        Reading {
            timestamp,
            voltage: round(voltage),
            current: round(current),
            power: round(power),
            temperature: frame
                .get(Field::Temperature)
                .or(previous.temperature)
                .map(round),
            state_of_charge: round(clamp_percent(state_of_charge)),
            state_of_health: round(clamp_percent(state_of_health)),
            cycle_count,
            energy: frame.get(Field::Energy).or(previous.energy).map(round),
            connected: true,
            error: None,
        }
    }

    /// Estimate state of health from voltage against the nominal full charge
    pub fn derive_state_of_health(&self, voltage: f64) -> f64 {
        let percent = voltage / self.nominal_full_charge_voltage * 100.0;
        clamp_percent(percent.min(100.0))
    }
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

fn round(value: f64) -> f64 {
    let scale = 10f64.powi(DECIMAL_PLACES);
    (value * scale).round() / scale
}
