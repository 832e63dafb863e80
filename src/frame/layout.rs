//! # Wire Layouts
//!
//! Field order of the comma-separated telemetry line emitted by the battery
//! monitor. The layout is fixed by configuration and never inferred from data.

use serde::Deserialize;

use crate::error::{Result, TelemetryError};

/// Field delimiter on the wire
pub const FIELD_DELIMITER: char = ',';

/// A single telemetry field as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Pack voltage in volts
    Voltage,
    /// Current in milliamps
    Current,
    /// Power in milliwatts
    Power,
    /// Temperature in degrees Celsius
    Temperature,
    /// State of charge in percent
    StateOfCharge,
    /// State of health in percent
    StateOfHealth,
    /// Charge cycle counter
    CycleCount,
    /// Accumulated energy in milliwatt-hours
    Energy,
}

impl Field {
    /// Column name used in logs and status output
    pub fn name(self) -> &'static str {
        match self {
            Field::Voltage => "voltage",
            Field::Current => "current",
            Field::Power => "power",
            Field::Temperature => "temperature",
            Field::StateOfCharge => "state_of_charge",
            Field::StateOfHealth => "state_of_health",
            Field::CycleCount => "cycle_count",
            Field::Energy => "energy",
        }
    }
}

/// Named wire formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `voltage,current,state_of_charge`
    Compact,
    /// `voltage,current,power,temperature,state_of_charge,state_of_health,cycle_count`
    Extended,
    /// Field order given explicitly in configuration
    Custom,
}

const COMPACT_FIELDS: &[Field] = &[Field::Voltage, Field::Current, Field::StateOfCharge];

const EXTENDED_FIELDS: &[Field] = &[
    Field::Voltage,
    Field::Current,
    Field::Power,
    Field::Temperature,
    Field::StateOfCharge,
    Field::StateOfHealth,
    Field::CycleCount,
];

/// Fields every layout must carry
const REQUIRED_FIELDS: &[Field] = &[Field::Voltage, Field::Current, Field::StateOfCharge];

/// Validated field order for one deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    fields: Vec<Field>,
}

impl FrameLayout {
    /// Build a layout from an explicit field order
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the layout has fewer than two fields,
    /// repeats a field, or lacks voltage, current or state of charge.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        if fields.len() < 2 {
            return Err(TelemetryError::InvalidConfig(
                "frame layout needs at least 2 fields".to_string(),
            ));
        }

        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                return Err(TelemetryError::InvalidConfig(format!(
                    "frame layout lists {} more than once",
                    field.name()
                )));
            }
        }

        for required in REQUIRED_FIELDS {
            if !fields.contains(required) {
                return Err(TelemetryError::InvalidConfig(format!(
                    "frame layout must include {}",
                    required.name()
                )));
            }
        }

        Ok(Self { fields })
    }

    /// Resolve a named format, using `custom_fields` only for `WireFormat::Custom`
    pub fn from_format(format: WireFormat, custom_fields: &[Field]) -> Result<Self> {
        match format {
            WireFormat::Compact => Self::new(COMPACT_FIELDS.to_vec()),
            WireFormat::Extended => Self::new(EXTENDED_FIELDS.to_vec()),
            WireFormat::Custom => Self::new(custom_fields.to_vec()),
        }
    }

    /// 3-field layout
    pub fn compact() -> Self {
        Self { fields: COMPACT_FIELDS.to_vec() }
    }

    /// 7-field layout
    pub fn extended() -> Self {
        Self { fields: EXTENDED_FIELDS.to_vec() }
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn contains(&self, field: Field) -> bool {
        self.fields.contains(&field)
    }
}
