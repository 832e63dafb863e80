//! # Battery Telemetry Library
//!
//! Ingests telemetry from a battery-monitoring microcontroller over a serial
//! link.
//!
//! This library provides the ingestion pipeline: opening and validating the
//! serial channel, decoding comma-separated frames, normalizing them into a
//! canonical [`telemetry::Reading`], publishing the latest reading to status
//! consumers, and appending readings to a CSV log for reporting.

pub mod config;
pub mod error;
pub mod frame;
pub mod serial;
pub mod supervisor;
pub mod telemetry;
