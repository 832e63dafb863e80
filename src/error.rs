//! # Error Types
//!
//! Custom error types for the telemetry pipeline using `thiserror`.

use thiserror::Error;

/// Reasons a single telemetry line is rejected by the frame decoder.
///
/// None of these break the serial link; the supervisor keeps the previous
/// reading and reports a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Line was empty after trimming whitespace
    #[error("empty frame")]
    EmptyFrame,

    /// Line contains no field delimiter
    #[error("malformed frame: no delimiter in {0:?}")]
    MalformedFrame(String),

    /// Field count does not match the configured layout
    #[error("arity mismatch: expected {expected} fields, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    /// A field could not be coerced to its numeric type
    #[error("field {index} is not a valid number: {raw_value:?}")]
    FieldParseError { index: usize, raw_value: String },
}

/// Main error type for the telemetry pipeline
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Serial device could not be opened or validated
    #[error("could not open {device}: {reason}")]
    ChannelOpen { device: String, reason: String },

    /// Mid-stream failure on an open channel
    #[error("serial I/O error: {0}")]
    ChannelIo(std::io::Error),

    /// Frame decoding errors
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Persisted log could not be written
    #[error("log sink error: {0}")]
    SinkWrite(String),

    /// Persisted log could not be parsed back
    #[error("log read error: {0}")]
    LogRead(String),

    /// Configuration parse errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the telemetry pipeline
pub type Result<T> = std::result::Result<T, TelemetryError>;
