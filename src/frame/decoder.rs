//! # Frame Decoder
//!
//! Turns one raw telemetry line into typed field values.
//!
//! Decoding is all-or-nothing: a line either yields a value for every field of
//! the configured layout, or it is rejected with a [`DecodeError`].

use super::layout::{Field, FrameLayout, FIELD_DELIMITER};
use crate::error::DecodeError;

/// Typed field values decoded from one line, in wire order
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    values: Vec<(Field, f64)>,
}

impl RawFrame {
    /// Value of `field`, if the layout carries it
    pub fn get(&self, field: Field) -> Option<f64> {
        self.values
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Decoder bound to one fixed layout
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    layout: FrameLayout,
}

impl FrameDecoder {
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Decode one line of raw bytes
    ///
    /// Invalid UTF-8 sequences are replaced rather than failing the frame.
    /// A single trailing delimiter is tolerated, since firmware commonly
    /// prints `value,` for every field including the last.
    ///
    /// # Errors
    ///
    /// - `EmptyFrame` if nothing remains after trimming
    /// - `MalformedFrame` if the line has no delimiter
    /// - `ArityMismatch` if the field count differs from the layout
    /// - `FieldParseError` for the first field that is not a finite number
    ///   (or not a non-negative integer for the cycle count)
    ///
    /// # Examples
    ///
    /// ```
    /// use battery_telemetry::frame::{Field, FrameDecoder, FrameLayout};
    ///
    /// let decoder = FrameDecoder::new(FrameLayout::compact());
    /// let frame = decoder.decode(b"3.90,120.0,3,\r\n").unwrap();
    /// assert_eq!(frame.get(Field::Voltage), Some(3.90));
    /// ```
    pub fn decode(&self, line: &[u8]) -> Result<RawFrame, DecodeError> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();

        if text.is_empty() {
            return Err(DecodeError::EmptyFrame);
        }

        if !text.contains(FIELD_DELIMITER) {
            return Err(DecodeError::MalformedFrame(text.to_string()));
        }

        let body = text.strip_suffix(FIELD_DELIMITER).unwrap_or(text);
        let parts: Vec<&str> = body.split(FIELD_DELIMITER).collect();

        if parts.len() != self.layout.arity() {
            return Err(DecodeError::ArityMismatch {
                expected: self.layout.arity(),
                actual: parts.len(),
            });
        }

        let values = self
            .layout
            .fields()
            .iter()
            .zip(parts)
            .enumerate()
            .map(|(index, (&field, raw))| {
                parse_field(field, raw.trim())
                    .map(|value| (field, value))
                    .ok_or_else(|| DecodeError::FieldParseError {
                        index,
                        raw_value: raw.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RawFrame { values })
    }
}

fn parse_field(field: Field, raw: &str) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    // Firmware prints the counter as a float on some boards ("12.0")
    if field == Field::CycleCount && (value < 0.0 || value > u32::MAX as f64) {
        return None;
    }

    Some(value)
}
