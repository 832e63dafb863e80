//! # Connection Supervisor
//!
//! Owns the serial channel and drives the ingest loop:
//! open → read line → decode → normalize → publish → log.
//!
//! Logging only queues the reading for a [`LogWriter`] task; the loop itself
//! waits on nothing but the channel read, the open attempt and the backoff.
//!
//! ## Link States
//!
//! ```text
//! Disconnected --open attempt--> Connecting --opened--> Connected
//! Connecting   --open failed---> Disconnected
//! Connected    --I/O error/EOF-> Disconnected
//! Disconnected --backoff------> Connecting
//! ```
//!
//! Decode failures, and lines too long to frame, do not change the link
//! state. The previous reading is republished with `error = "Parse error"`
//! and `connected = true`.
//!
//! ## Sharing
//!
//! The latest [`Status`] lives in a `tokio::sync::watch` cell. Every update
//! replaces the whole record, so a [`StatusHandle`] never sees a half-written
//! reading, and readers never block the loop.

use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{Result, TelemetryError};
use crate::frame::FrameDecoder;
use crate::serial::{Connector, LineSource, PortResolver};
use crate::telemetry::{LogWriter, Normalizer, Reading, ReadingLog, ReadingSink, PARSE_ERROR};

/// Diagnostic published once a channel is open but before its first frame
pub const AWAITING_DATA: &str = "Waiting for data";

/// Diagnostic published when the supervisor exits
pub const STOPPED: &str = "Ingestion stopped";

/// Link state of the telemetry channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a status query can observe
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub reading: Reading,
    pub state: ConnectionState,
}

/// Serializable status query result
///
/// Reading fields are flattened next to the link state, e.g.
/// `{"timestamp": ..., "voltage": 3.9, ..., "connected": true, "error": null, "state": "connected"}`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub reading: Reading,
    pub state: ConnectionState,
}

/// Read-only view of the supervisor's latest status
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<Status>,
}

impl StatusHandle {
    pub fn status(&self) -> Status {
        self.rx.borrow().clone()
    }

    pub fn reading(&self) -> Reading {
        self.rx.borrow().reading.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn report(&self) -> StatusReport {
        let status = self.status();
        StatusReport {
            reading: status.reading,
            state: status.state,
        }
    }

    /// Wait for the next publish
    ///
    /// Returns `false` once the supervisor has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Single owner of the telemetry channel
pub struct Supervisor<C> {
    resolver: PortResolver<C>,
    decoder: FrameDecoder,
    normalizer: Normalizer,
    sink: Option<Arc<dyn ReadingSink>>,
    log: Option<LogWriter>,
    reconnect_interval: Duration,
    read_timeout: Duration,
    status: watch::Sender<Status>,
}

enum ReadOutcome {
    Line(Vec<u8>),
    Rejected(io::Error),
    Idle,
    LinkLost(String),
}

impl<C: Connector> Supervisor<C> {
    /// Build a supervisor from validated configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the frame layout does not resolve.
    pub fn new(connector: C, config: &Config) -> Result<Self> {
        let decoder = FrameDecoder::new(config.frame.layout()?);
        let normalizer = Normalizer::new(
            config.battery.nominal_full_charge_voltage,
            config.battery.current_sign,
        );
        let sink = config.log.enabled.then(|| {
            Arc::new(ReadingLog::new(config.log.path.as_str())) as Arc<dyn ReadingSink>
        });

        let (status, _) = watch::channel(Status {
            reading: Reading::initial(Utc::now()),
            state: ConnectionState::Disconnected,
        });

        Ok(Self {
            resolver: PortResolver::new(connector, &config.serial, decoder.clone()),
            decoder,
            normalizer,
            sink,
            log: None,
            reconnect_interval: Duration::from_millis(config.serial.reconnect_interval_ms),
            read_timeout: Duration::from_millis(config.serial.timeout_ms),
            status,
        })
    }

    /// Log good readings to `sink` instead of the configured CSV file
    pub fn with_sink(mut self, sink: Arc<dyn ReadingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Handle for status queries; clone freely
    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            rx: self.status.subscribe(),
        }
    }

    /// Run until `cancel` fires
    ///
    /// Never returns an error: open failures back off and retry, link
    /// failures reconnect, and bad frames keep the last good reading.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Telemetry supervisor started");

        let mut writer = None;
        if let Some(sink) = self.sink.clone() {
            let (log, task) = LogWriter::spawn(sink);
            self.log = Some(log);
            writer = Some(task);
        }

        let mut channel: Option<Box<dyn LineSource>> = None;
        let mut first_attempt = true;

        loop {
            let Some(mut port) = channel.take() else {
                if !first_attempt {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.reconnect_interval) => {}
                    }
                }
                first_attempt = false;

                self.set_state(ConnectionState::Connecting);
                let opened = tokio::select! {
                    _ = cancel.cancelled() => break,
                    opened = self.resolver.open() => opened,
                };

                match opened {
                    Ok(opened) => {
                        self.mark_connected();
                        if let Some(frame) = opened.first_frame {
                            self.ingest(&frame);
                        }
                        channel = Some(opened.channel);
                    }
                    Err(e) => {
                        warn!("{}; retrying in {:?}", e, self.reconnect_interval);
                        self.mark_disconnected(e.to_string());
                    }
                }
                continue;
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                read = timeout(self.read_timeout, port.read_line()) => match read {
                    Err(_) => ReadOutcome::Idle,
                    Ok(Ok(Some(line))) => ReadOutcome::Line(line),
                    Ok(Ok(None)) => ReadOutcome::LinkLost("serial device disconnected".to_string()),
                    Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => ReadOutcome::Rejected(e),
                    Ok(Err(e)) => ReadOutcome::LinkLost(TelemetryError::ChannelIo(e).to_string()),
                },
            };

            match outcome {
                ReadOutcome::Line(line) => {
                    self.ingest(&line);
                    channel = Some(port);
                }
                ReadOutcome::Rejected(reason) => {
                    self.reject("<over-long line>", reason);
                    channel = Some(port);
                }
                ReadOutcome::Idle => {
                    trace!("No data within {:?}", self.read_timeout);
                    channel = Some(port);
                }
                ReadOutcome::LinkLost(reason) => {
                    warn!("Link lost: {}", reason);
                    self.mark_disconnected(reason);
                }
            }
        }

        self.mark_disconnected(STOPPED.to_string());

        // Dropping the last sender lets the writer drain and exit
        self.log = None;
        if let Some(task) = writer {
            if let Err(e) = task.await {
                warn!("Log writer failed: {}", e);
            }
        }
        info!("Telemetry supervisor stopped");
    }

    /// Decode, normalize, publish and log one line
    fn ingest(&self, line: &[u8]) {
        match self.decoder.decode(line) {
            Ok(frame) => {
                let previous = self.status.borrow().reading.clone();
                let reading = self.normalizer.normalize(&frame, &previous);
                debug!(
                    "Reading: {:.2} V, {:.2} mA, {:.2} mW, SoC {:.2}%, SoH {:.2}%",
                    reading.voltage,
                    reading.current,
                    reading.power,
                    reading.state_of_charge,
                    reading.state_of_health
                );
                self.publish(reading.clone());

                if let Some(log) = &self.log {
                    log.submit(reading);
                }
            }
            Err(e) => self.reject(String::from_utf8_lossy(line).trim(), e),
        }
    }

    /// Keep the last good values and flag the parse error
    fn reject(&self, line: &str, reason: impl Display) {
        warn!("Rejected frame {:?}: {}", line, reason);
        let previous = self.status.borrow().reading.clone();
        self.publish(previous.with_error(PARSE_ERROR, true));
    }

    fn publish(&self, reading: Reading) {
        self.status.send_modify(|status| status.reading = reading);
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }

    fn mark_connected(&self) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Connected;
            status.reading = status.reading.with_error(AWAITING_DATA, true);
        });
    }

    fn mark_disconnected(&self, reason: String) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.reading = status.reading.with_error(reason, false);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::port_trait::mocks::{MockConnector, MockLineSource, Step};
    use crate::telemetry::{read_log, NO_DATA};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    const GOOD_FRAME: &str = "3.90,120.0,3,\n";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.serial.port = "/dev/ttyMOCK0".to_string();
        config.serial.settle_ms = 0;
        config.serial.validation_lines = 0;
        config.log.enabled = false;
        config
    }

    fn spawn(
        connector: MockConnector,
        config: &Config,
    ) -> (StatusHandle, CancellationToken, JoinHandle<()>) {
        let supervisor = Supervisor::new(connector, config).unwrap();
        let handle = supervisor.status_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));
        (handle, cancel, task)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_status_before_connect() {
        let supervisor = Supervisor::new(MockConnector::new(), &test_config()).unwrap();
        let handle = supervisor.status_handle();

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!handle.reading().connected);
        assert_eq!(handle.reading().error.as_deref(), Some(NO_DATA));
    }

    #[tokio::test(start_paused = true)]
    async fn test_good_frame_is_published() {
        let connector =
            MockConnector::new().with_channel(MockLineSource::new([Step::line(GOOD_FRAME)]));
        let (handle, cancel, task) = spawn(connector, &test_config());

        advance(100).await;

        let reading = handle.reading();
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(reading.voltage, 3.90);
        assert_eq!(reading.current, 120.0);
        assert_eq!(reading.state_of_charge, 3.0);
        assert_eq!(reading.power, 468.0);
        assert_eq!(reading.state_of_health, 92.86);
        assert!(reading.connected);
        assert_eq!(reading.error, None);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_without_data_waits() {
        let connector = MockConnector::new().with_channel(MockLineSource::new(Vec::<Step>::new()));
        let (handle, cancel, task) = spawn(connector, &test_config());

        advance(3000).await;

        assert_eq!(handle.state(), ConnectionState::Connected);
        let reading = handle.reading();
        assert!(reading.connected);
        assert_eq!(reading.error.as_deref(), Some(AWAITING_DATA));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_error_keeps_previous_reading() {
        let connector = MockConnector::new().with_channel(MockLineSource::new([
            Step::line(GOOD_FRAME),
            Step::line("bad,data\n"),
        ]));
        let (handle, cancel, task) = spawn(connector, &test_config());

        advance(100).await;

        let reading = handle.reading();
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(reading.voltage, 3.90);
        assert_eq!(reading.current, 120.0);
        assert_eq!(reading.power, 468.0);
        assert_eq!(reading.state_of_health, 92.86);
        assert_eq!(reading.error.as_deref(), Some(PARSE_ERROR));
        assert!(reading.connected);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_never_change_values() {
        let connector = MockConnector::new().with_channel(MockLineSource::new([
            Step::line("4.05,-250.5,77\n"),
            Step::line("\n"),
            Step::line("no delimiter\n"),
            Step::line("1,2,3,4,5\n"),
            Step::line("4.1,abc,80\n"),
            Step::Line(vec![0xFF, 0xFE, b',', b'1', b',', b'2', b'\n']),
        ]));
        let (handle, cancel, task) = spawn(connector, &test_config());

        advance(100).await;

        let reading = handle.reading();
        assert_eq!(reading.voltage, 4.05);
        assert_eq!(reading.current, -250.5);
        assert_eq!(reading.state_of_charge, 77.0);
        assert_eq!(reading.error.as_deref(), Some(PARSE_ERROR));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_line_is_rejected_without_dropping_link() {
        let connector = MockConnector::new().with_channel(MockLineSource::new([
            Step::line(GOOD_FRAME),
            Step::Error(io::ErrorKind::InvalidData),
        ]));
        let (handle, cancel, task) = spawn(connector.clone(), &test_config());

        advance(100).await;

        let reading = handle.reading();
        assert!(handle.is_connected());
        assert!(reading.connected);
        assert_eq!(reading.voltage, 3.90);
        assert_eq!(reading.error.as_deref(), Some(PARSE_ERROR));
        assert_eq!(connector.attempts().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failures_retry_without_connecting() {
        let connector = MockConnector::new()
            .with_failure("Device or resource busy")
            .with_failure("Device or resource busy")
            .with_failure("Permission denied");
        let (handle, cancel, task) = spawn(connector.clone(), &test_config());

        // Attempts at t = 0s, 5s, 10s, 15s
        for _ in 0..4 {
            advance(4000).await;
            assert_ne!(handle.state(), ConnectionState::Connected);
            assert!(!handle.reading().connected);
        }

        assert!(connector.attempts().len() >= 3);
        assert!(handle.reading().error.unwrap().contains("could not open"));
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_error_disconnects_and_reconnects() {
        let connector = MockConnector::new()
            .with_channel(MockLineSource::new([
                Step::line(GOOD_FRAME),
                Step::Error(io::ErrorKind::BrokenPipe),
            ]))
            .with_channel(MockLineSource::new([Step::line("4.00,100,50\n")]));
        let (handle, cancel, task) = spawn(connector.clone(), &test_config());

        advance(100).await;

        let reading = handle.reading();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!reading.connected);
        assert_eq!(reading.voltage, 3.90);
        assert!(reading.error.unwrap().contains("serial I/O error"));
        assert_eq!(connector.attempts().len(), 1);

        // Backoff is 5s
        advance(5000).await;

        let reading = handle.reading();
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert!(reading.connected);
        assert_eq!(reading.voltage, 4.0);
        assert_eq!(reading.error, None);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_is_link_breaking() {
        let connector = MockConnector::new()
            .with_channel(MockLineSource::new([Step::line(GOOD_FRAME), Step::Eof]));
        let (handle, cancel, task) = spawn(connector, &test_config());

        advance(100).await;

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!handle.reading().connected);
        assert_eq!(handle.reading().voltage, 3.90);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_validated_frame_is_ingested() {
        let mut config = test_config();
        config.serial.validation_lines = 3;

        let connector = MockConnector::new()
            .with_channel(MockLineSource::new([Step::line("junk\n"), Step::line(GOOD_FRAME)]));
        let (handle, cancel, task) = spawn(connector, &config);

        advance(100).await;

        assert_eq!(handle.reading().voltage, 3.90);
        assert_eq!(handle.reading().error, None);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_blocked_read() {
        let connector = MockConnector::new().with_channel(MockLineSource::new([Step::line(GOOD_FRAME)]));
        let (handle, cancel, task) = spawn(connector, &test_config());

        advance(100).await;
        cancel.cancel();
        task.await.unwrap();

        let reading = handle.reading();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!reading.connected);
        assert_eq!(reading.error.as_deref(), Some(STOPPED));
        assert_eq!(reading.voltage, 3.90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_backoff() {
        let (_handle, cancel, task) = spawn(MockConnector::new(), &test_config());

        advance(100).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_good_readings_are_logged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("battery_log.csv");

        let mut config = test_config();
        config.log.enabled = true;
        config.log.path = path.to_string_lossy().into_owned();

        let connector = MockConnector::new().with_channel(MockLineSource::new([
            Step::line(GOOD_FRAME),
            Step::line("bad,data\n"),
            Step::line("3.80,110.0,2\n"),
        ]));
        let (_handle, cancel, task) = spawn(connector, &config);

        advance(100).await;
        cancel.cancel();
        task.await.unwrap();

        let logged = read_log(&path).unwrap();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].voltage, 3.90);
        assert_eq!(logged[1].voltage, 3.80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_does_not_stop_ingestion() {
        let dir = TempDir::new().unwrap();

        let mut config = test_config();
        config.log.enabled = true;
        // A directory cannot be appended to
        config.log.path = dir.path().to_string_lossy().into_owned();

        let connector = MockConnector::new().with_channel(MockLineSource::new([
            Step::line(GOOD_FRAME),
            Step::line("3.80,110.0,2\n"),
        ]));
        let (handle, cancel, task) = spawn(connector, &config);

        advance(100).await;

        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(handle.reading().voltage, 3.80);
        assert_eq!(handle.reading().error, None);

        cancel.cancel();
        task.await.unwrap();
    }

    /// Sink whose writes block until the test lets them through
    struct StalledSink {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        written: AtomicUsize,
    }

    impl ReadingSink for StalledSink {
        fn append(&self, _reading: &Reading) -> Result<()> {
            let _ = self.gate.lock().unwrap().recv();
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // Real time: paused clocks do not advance while blocking writes are in flight
    #[tokio::test]
    async fn test_stalled_sink_does_not_delay_publishing() {
        let (gate, gated) = std::sync::mpsc::channel();
        let sink = Arc::new(StalledSink {
            gate: Mutex::new(gated),
            written: AtomicUsize::new(0),
        });

        let connector = MockConnector::new().with_channel(MockLineSource::new([
            Step::line(GOOD_FRAME),
            Step::line("3.80,110.0,2\n"),
        ]));
        let supervisor = Supervisor::new(connector, &test_config())
            .unwrap()
            .with_sink(sink.clone());
        let handle = supervisor.status_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_connected());
        assert_eq!(handle.reading().voltage, 3.80);
        assert_eq!(handle.reading().error, None);
        assert_eq!(sink.written.load(Ordering::SeqCst), 0);

        drop(gate);
        cancel.cancel();
        task.await.unwrap();

        // Queued rows are flushed before the supervisor returns
        assert_eq!(sink.written.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_report_json() {
        let connector =
            MockConnector::new().with_channel(MockLineSource::new([Step::line(GOOD_FRAME)]));
        let (handle, cancel, task) = spawn(connector, &test_config());

        advance(100).await;

        let json = serde_json::to_value(handle.report()).unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["connected"], true);
        assert_eq!(json["voltage"], 3.9);
        assert_eq!(json["power"], 468.0);
        assert!(json["error"].is_null());
        assert!(json["timestamp"].is_string());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_wakes_on_publish() {
        let connector =
            MockConnector::new().with_channel(MockLineSource::new([Step::line(GOOD_FRAME)]));
        let (mut handle, cancel, task) = spawn(connector, &test_config());

        let mut saw_reading = false;
        while handle.changed().await {
            if handle.reading().is_good() {
                saw_reading = true;
                break;
            }
        }
        assert!(saw_reading);

        cancel.cancel();
        task.await.unwrap();
    }
}
