//! # Reading Log
//!
//! Append-only CSV log of decoded readings, plus the reader and summary the
//! reporting side uses.
//!
//! The file gets a header row when it is created and is never rewritten after
//! that. Only good readings are logged; carried-over values from failed frames
//! would duplicate rows and skew the summary.
//!
//! Rows are written by a [`LogWriter`] task on tokio's blocking pool, so a
//! slow disk never holds up the ingest loop. When the queue is full new rows
//! are dropped with a warning.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reading::Reading;
use crate::error::{Result, TelemetryError};

/// Column names, in file order
pub const LOG_HEADER: [&str; 9] = [
    "timestamp",
    "voltage",
    "current",
    "power",
    "temperature",
    "state_of_charge",
    "state_of_health",
    "cycle_count",
    "energy",
];

/// Rows queued for the writer before new ones are dropped
pub const LOG_QUEUE_DEPTH: usize = 256;

/// One row of the log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LogRow {
    timestamp: DateTime<Utc>,
    voltage: f64,
    current: f64,
    power: f64,
    temperature: Option<f64>,
    state_of_charge: f64,
    state_of_health: f64,
    cycle_count: u32,
    energy: Option<f64>,
}

impl From<&Reading> for LogRow {
    fn from(r: &Reading) -> Self {
        Self {
            timestamp: r.timestamp,
            voltage: r.voltage,
            current: r.current,
            power: r.power,
            temperature: r.temperature,
            state_of_charge: r.state_of_charge,
            state_of_health: r.state_of_health,
            cycle_count: r.cycle_count,
            energy: r.energy,
        }
    }
}

impl From<LogRow> for Reading {
    fn from(row: LogRow) -> Self {
        Reading {
            timestamp: row.timestamp,
            voltage: row.voltage,
            current: row.current,
            power: row.power,
            temperature: row.temperature,
            state_of_charge: row.state_of_charge,
            state_of_health: row.state_of_health,
            cycle_count: row.cycle_count,
            energy: row.energy,
            connected: true,
            error: None,
        }
    }
}

/// Best-effort CSV sink for readings
#[derive(Debug, Clone)]
pub struct ReadingLog {
    path: PathBuf,
}

impl ReadingLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one reading, creating the file (and its header) if needed
    ///
    /// The file is reopened for every row so that an operator moving or
    /// deleting it does not wedge the sink.
    ///
    /// # Errors
    ///
    /// Returns `SinkWrite` if the directory or file cannot be created or the
    /// row cannot be written.
    pub fn append(&self, reading: &Reading) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    TelemetryError::SinkWrite(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                TelemetryError::SinkWrite(format!("failed to open {}: {}", self.path.display(), e))
            })?;

        let is_new = file
            .metadata()
            .map_err(|e| TelemetryError::SinkWrite(e.to_string()))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if is_new {
            info!("Creating reading log at {}", self.path.display());
            writer
                .write_record(LOG_HEADER)
                .map_err(|e| TelemetryError::SinkWrite(e.to_string()))?;
        }

        writer
            .serialize(LogRow::from(reading))
            .map_err(|e| TelemetryError::SinkWrite(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TelemetryError::SinkWrite(e.to_string()))?;

        debug!("Logged reading at {}", reading.timestamp);
        Ok(())
    }
}

/// Destination for good readings
///
/// `append` may block; the [`LogWriter`] only calls it on the blocking pool.
pub trait ReadingSink: Send + Sync + 'static {
    fn append(&self, reading: &Reading) -> Result<()>;
}

impl ReadingSink for ReadingLog {
    fn append(&self, reading: &Reading) -> Result<()> {
        ReadingLog::append(self, reading)
    }
}

/// Bounded queue in front of a [`ReadingSink`]
#[derive(Debug, Clone)]
pub struct LogWriter {
    tx: mpsc::Sender<Reading>,
}

impl LogWriter {
    /// Start the writer task
    ///
    /// The task ends once every `LogWriter` clone is dropped and the queue
    /// is drained. Write errors are logged and the next row is attempted.
    pub fn spawn(sink: Arc<dyn ReadingSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Reading>(LOG_QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            while let Some(reading) = rx.recv().await {
                let sink = Arc::clone(&sink);
                match tokio::task::spawn_blocking(move || sink.append(&reading)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to log reading: {}", e),
                    Err(e) => warn!("Log write panicked: {}", e),
                }
            }
            debug!("Log writer stopped");
        });

        (Self { tx }, task)
    }

    /// Queue a reading without waiting
    pub fn submit(&self, reading: Reading) {
        match self.tx.try_send(reading) {
            Ok(()) => {}
            Err(TrySendError::Full(reading)) => warn!(
                "Log writer is {} rows behind; dropping reading at {}",
                LOG_QUEUE_DEPTH, reading.timestamp
            ),
            Err(TrySendError::Closed(_)) => warn!("Log writer has stopped; reading not logged"),
        }
    }
}

/// Read every row of a reading log
///
/// # Errors
///
/// Returns `LogRead` if the file is missing or any row fails to parse.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<Reading>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| TelemetryError::LogRead(format!("{}: {}", path.display(), e)))?;

    reader
        .deserialize::<LogRow>()
        .map(|row| {
            row.map(Reading::from)
                .map_err(|e| TelemetryError::LogRead(format!("{}: {}", path.display(), e)))
        })
        .collect()
}

/// Min, max and mean of one numeric column
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColumnStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl ColumnStats {
    fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }

        (count > 0).then(|| Self {
            min,
            max,
            mean: sum / count as f64,
        })
    }
}

/// Aggregate view of a reading log, as consumed by report generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSummary {
    pub rows: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub voltage: ColumnStats,
    pub current: ColumnStats,
    pub power: ColumnStats,
    pub temperature: Option<ColumnStats>,
    pub state_of_charge: ColumnStats,
    pub state_of_health: ColumnStats,
    pub cycle_count: ColumnStats,
    pub energy: Option<ColumnStats>,
}

impl LogSummary {
    /// Summarize readings; `None` when there are no readings
    pub fn from_readings(readings: &[Reading]) -> Option<Self> {
        let first = readings.iter().map(|r| r.timestamp).min()?;
        let last = readings.iter().map(|r| r.timestamp).max()?;
        let column = |f: fn(&Reading) -> f64| ColumnStats::from_values(readings.iter().map(f));

        Some(Self {
            rows: readings.len(),
            first,
            last,
            voltage: column(|r| r.voltage)?,
            current: column(|r| r.current)?,
            power: column(|r| r.power)?,
            temperature: ColumnStats::from_values(readings.iter().filter_map(|r| r.temperature)),
            state_of_charge: column(|r| r.state_of_charge)?,
            state_of_health: column(|r| r.state_of_health)?,
            cycle_count: column(|r| r.cycle_count as f64)?,
            energy: ColumnStats::from_values(readings.iter().filter_map(|r| r.energy)),
        })
    }
}
