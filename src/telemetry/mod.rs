//! # Telemetry Module
//!
//! Canonical readings and where they go after decoding.
//!
//! This module handles:
//! - The `Reading` record exposed to status consumers
//! - Normalizing decoded frames (derived power and state of health)
//! - Appending readings to a CSV log from a background writer
//! - Reading the log back and summarizing it for reports

pub mod log;
pub mod normalizer;
pub mod reading;

pub use log::{
    read_log, ColumnStats, LogSummary, LogWriter, ReadingLog, ReadingSink, LOG_HEADER,
    LOG_QUEUE_DEPTH,
};
pub use normalizer::{CurrentSign, Normalizer, DECIMAL_PLACES};
pub use reading::{Reading, NO_DATA, PARSE_ERROR};
