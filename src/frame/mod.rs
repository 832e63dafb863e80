//! # Frame Module
//!
//! Newline-delimited, comma-separated telemetry frames.
//!
//! This module handles:
//! - Wire layouts (which field sits at which position)
//! - Lossy byte-to-text decoding
//! - Arity validation and numeric coercion

pub mod decoder;
pub mod layout;

pub use decoder::{FrameDecoder, RawFrame};
pub use layout::{Field, FrameLayout, WireFormat, FIELD_DELIMITER};
