//! # Serial Communication Module
//!
//! Handles the serial link to the battery monitor.
//!
//! This module handles:
//! - Opening the device by name, or auto-detecting it
//! - Waiting for the board to settle after the port resets it
//! - Discarding stale buffered bytes
//! - Confirming the channel carries well-formed frames before use

pub mod port_trait;

pub use port_trait::{Connector, LineBuffer, LineSource, SerialConnector, SerialLineSource};

use std::io;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::error::{Result, TelemetryError};
use crate::frame::FrameDecoder;

/// Port name that requests auto-detection
pub const AUTO_DETECT_PORT: &str = "auto";

/// A channel returned by [`PortResolver::open`]
pub struct OpenedChannel {
    /// The open channel, exclusively owned by the caller
    pub channel: Box<dyn LineSource>,
    /// Device the channel was opened on
    pub device: String,
    /// Whether a well-formed frame was seen during validation
    pub validated: bool,
    /// The frame that validated the channel, not yet ingested
    pub first_frame: Option<Vec<u8>>,
}

impl std::fmt::Debug for OpenedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedChannel")
            .field("device", &self.device)
            .field("validated", &self.validated)
            .finish_non_exhaustive()
    }
}

/// Opens and validates the telemetry channel
///
/// Retrying is left to the caller; a single [`open`](Self::open) call tries
/// each candidate device once.
pub struct PortResolver<C> {
    connector: C,
    port: String,
    baud_rate: u32,
    read_timeout: Duration,
    settle: Duration,
    validation_lines: u32,
    decoder: FrameDecoder,
}

impl<C: Connector> PortResolver<C> {
    pub fn new(connector: C, config: &SerialConfig, decoder: FrameDecoder) -> Self {
        Self {
            connector,
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            read_timeout: Duration::from_millis(config.timeout_ms),
            settle: Duration::from_millis(config.settle_ms),
            validation_lines: config.validation_lines,
            decoder,
        }
    }

    fn candidates(&self) -> Vec<String> {
        if self.port == AUTO_DETECT_PORT {
            let ports = self.connector.available_ports();
            debug!("Auto-detect found {} serial port(s): {:?}", ports.len(), ports);
            ports
        } else {
            vec![self.port.clone()]
        }
    }

    /// Open the first candidate device that accepts a connection
    ///
    /// A channel that opens but shows no parseable frame within the
    /// validation reads is still returned, with `validated == false`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelOpen` if no device could be opened, or if the device
    /// failed or closed during validation.
    pub async fn open(&self) -> Result<OpenedChannel> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(TelemetryError::ChannelOpen {
                device: AUTO_DETECT_PORT.to_string(),
                reason: "no serial ports found".to_string(),
            });
        }

        let mut last_reason = String::new();
        for device in &candidates {
            debug!("Trying to open serial port: {}", device);

            match self.open_device(device).await {
                Ok(opened) => return Ok(opened),
                Err(e) => {
                    warn!("Failed to open {}: {}", device, e);
                    last_reason = match e {
                        TelemetryError::ChannelOpen { reason, .. } => reason,
                        other => other.to_string(),
                    };
                }
            }
        }

        Err(TelemetryError::ChannelOpen {
            device: candidates.join(", "),
            reason: last_reason,
        })
    }

    async fn open_device(&self, device: &str) -> Result<OpenedChannel> {
        let mut channel = self.connector.connect(device, self.baud_rate).await?;

        // Opening the port resets most boards; give the firmware time to boot
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }

        channel
            .clear_input()
            .map_err(|e| TelemetryError::ChannelOpen {
                device: device.to_string(),
                reason: format!("failed to clear input buffer: {}", e),
            })?;

        let first_frame = self.validate(device, channel.as_mut()).await?;
        let validated = first_frame.is_some();

        if validated {
            info!("Opened {} at {} baud, telemetry validated", device, self.baud_rate);
        } else if self.validation_lines > 0 {
            warn!(
                "Opened {} but saw no valid frame in {} read(s); continuing unvalidated",
                device, self.validation_lines
            );
        } else {
            info!("Opened {} at {} baud", device, self.baud_rate);
        }

        Ok(OpenedChannel {
            channel,
            device: device.to_string(),
            validated,
            first_frame,
        })
    }

    async fn validate(&self, device: &str, channel: &mut dyn LineSource) -> Result<Option<Vec<u8>>> {
        for attempt in 1..=self.validation_lines {
            match timeout(self.read_timeout, channel.read_line()).await {
                Err(_) => debug!("Validation read {} on {} timed out", attempt, device),
                Ok(Ok(Some(line))) => match self.decoder.decode(&line) {
                    Ok(_) => return Ok(Some(line)),
                    Err(e) => debug!("Validation read {} on {} rejected: {}", attempt, device, e),
                },
                Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    debug!("Validation read {} on {} rejected: {}", attempt, device, e)
                }
                Ok(Ok(None)) => {
                    return Err(TelemetryError::ChannelOpen {
                        device: device.to_string(),
                        reason: "device closed the stream during validation".to_string(),
                    })
                }
                Ok(Err(e)) => {
                    return Err(TelemetryError::ChannelOpen {
                        device: device.to_string(),
                        reason: format!("read failed during validation: {}", e),
                    })
                }
            }
        }

        Ok(None)
    }
}
