//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use tokio::io::AsyncReadExt;
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};
use tracing::warn;

use crate::error::{Result, TelemetryError};

/// Longest line accepted; anything longer is dropped through its newline
pub const MAX_LINE_LEN: usize = 256;

/// Line-oriented reads from an open telemetry channel
#[async_trait]
pub trait LineSource: Send {
    /// Read one newline-terminated line
    ///
    /// Returns `Ok(None)` when the device closes the stream. A line longer
    /// than [`MAX_LINE_LEN`] yields an `InvalidData` error; the source stays
    /// usable and resumes after that line's newline. Implementations must be
    /// cancel-safe: dropping the future loses no buffered bytes.
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Discard anything received but not yet read
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens telemetry channels by device name
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `device` at `baud_rate`
    async fn connect(&self, device: &str, baud_rate: u32) -> Result<Box<dyn LineSource>>;

    /// Device names worth trying when the port is auto-detected
    fn available_ports(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Splits a byte stream into newline-terminated lines
///
/// A line longer than [`MAX_LINE_LEN`] is reported once as `InvalidData`,
/// and every byte up to its newline is thrown away.
#[derive(Debug)]
pub struct LineBuffer {
    codec: AnyDelimiterCodec,
    pending: BytesMut,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self {
            codec: line_codec(),
            pending: BytesMut::with_capacity(MAX_LINE_LEN),
        }
    }
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_LINE_LEN)
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line without its `\n`
    pub fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.codec.decode(&mut self.pending) {
            Ok(line) => Ok(line.map(|line| line.to_vec())),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line longer than {} bytes discarded", MAX_LINE_LEN),
            )),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.codec = line_codec();
    }
}

/// `LineSource` over a tokio-serial stream
pub struct SerialLineSource {
    port: tokio_serial::SerialStream,
    buffer: LineBuffer,
}

impl SerialLineSource {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self {
            port,
            buffer: LineBuffer::default(),
        }
    }
}

#[async_trait]
impl LineSource for SerialLineSource {
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; 64];
        loop {
            if let Some(line) = self.buffer.next_line()? {
                return Ok(Some(line));
            }

            let n = self.port.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.push(&chunk[..n]);
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.port
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Opens real serial devices with 8N1 framing
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self, device: &str, baud_rate: u32) -> Result<Box<dyn LineSource>> {
        let port = tokio_serial::new(device, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TelemetryError::ChannelOpen {
                device: device.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SerialLineSource::new(port)))
    }

    fn available_ports(&self) -> Vec<String> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }
}
