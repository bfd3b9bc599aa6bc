//! Sample persistence
//!
//! Every decoded sample is appended to two independent files:
//!
//! - the structured log (`data.csv`), `timestamp,level,unit`, rotated by time
//! - the diagnostic log (`raw_log.txt`), the full decode plus raw bytes and
//!   lifecycle notes, rotated by size
//!
//! Each file has its own bounded queue and a single writer thread. Callers
//! never block on disk I/O; a full queue drops the line with a warning.

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Local, TimeDelta};
use common::Error;
use protocol::{Measurement, RawReport};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::StorageSettings;

/// Suffix format of files rotated by time
const INTERVAL_SUFFIX_FORMAT: &str = "%Y-%m-%d_%H";

/// When a stream starts a new file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Roll over before a line would push the file past `max_bytes`,
    /// keeping `max_files` numbered backups
    BySize { max_bytes: u64, max_files: u32 },
    /// Roll over once the current file covers `interval`
    ByInterval { interval: Duration },
}

/// Which streams accepted a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub structured: bool,
    pub diagnostic: bool,
}

/// `timestamp,level,unit`
pub fn structured_line(measurement: &Measurement) -> String {
    format!(
        "{},{},{}",
        measurement.timestamp_display(),
        measurement.level_display(),
        measurement.unit
    )
}

/// `timestamp,level,unit,speed,max_lock,range,[raw bytes]`
pub fn diagnostic_line(raw: &RawReport, measurement: &Measurement) -> String {
    format!(
        "{},{},{},{},{},{},{:?}",
        measurement.timestamp_display(),
        measurement.level_display(),
        measurement.unit,
        measurement.response_speed,
        measurement.max_lock,
        measurement.range,
        raw.bytes()
    )
}

/// Both log streams of a capture run
pub struct SampleSink {
    structured: LogStream,
    diagnostic: LogStream,
}

impl SampleSink {
    /// Create the log directory and start both writer threads
    pub fn new(settings: &StorageSettings) -> Result<Self> {
        let dir = settings.log_dir_path();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

        let structured = LogStream::spawn(
            "structured",
            settings.csv_path(),
            Rotation::ByInterval {
                interval: settings.csv_rotation(),
            },
            settings.queue_capacity,
        )?;

        let diagnostic = LogStream::spawn(
            "diagnostic",
            settings.raw_path(),
            Rotation::BySize {
                max_bytes: settings.raw_max_bytes,
                max_files: settings.raw_max_files,
            },
            settings.queue_capacity,
        )?;

        Ok(Self {
            structured,
            diagnostic,
        })
    }

    /// Queue one sample on both streams
    ///
    /// Safe to call from the reader thread while the capture loop writes
    /// notes. A rejected line on one stream does not affect the other.
    pub fn record(&self, raw: &RawReport, measurement: &Measurement) -> RecordOutcome {
        RecordOutcome {
            structured: accepted(self.structured.append(structured_line(measurement))),
            diagnostic: accepted(self.diagnostic.append(diagnostic_line(raw, measurement))),
        }
    }

    /// Append a lifecycle message to the diagnostic log
    pub fn note(&self, message: &str) -> bool {
        let line = format!(
            "{},{}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            message
        );
        accepted(self.diagnostic.append(line))
    }

    /// Flush queued lines and stop both writers
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.structured.shutdown();
        self.diagnostic.shutdown();
    }
}

fn accepted(result: common::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("{}", e);
            false
        }
    }
}

/// One append-only file fed through a bounded queue
pub struct LogStream {
    name: &'static str,
    sender: Sender<String>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogStream {
    /// Open `path` and start the `sink-<name>` writer thread
    ///
    /// The file is opened up front so a bad path fails here, not on the
    /// first sample.
    pub fn spawn(
        name: &'static str,
        path: PathBuf,
        rotation: Rotation,
        capacity: usize,
    ) -> Result<Self> {
        let mut writer = StreamWriter::new(path, rotation);
        writer.open_file(Local::now())?;

        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name(format!("sink-{}", name))
            .spawn(move || writer.run(receiver))
            .with_context(|| format!("Failed to spawn {} writer thread", name))?;

        Ok(Self {
            name,
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a line without blocking
    pub fn append(&self, line: String) -> common::Result<()> {
        match self.sender.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Channel(format!(
                "{} log queue full, line dropped",
                self.name
            ))),
            Err(TrySendError::Closed(_)) => {
                Err(Error::Sink(format!("{} log already shut down", self.name)))
            }
        }
    }

    /// Close the queue and wait until every accepted line is written
    pub fn shutdown(&self) {
        self.sender.close();

        let handle = lock(&self.handle).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("{} log writer thread panicked", self.name);
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owns the open file of one stream; lives on the writer thread
struct StreamWriter {
    path: PathBuf,
    rotation: Rotation,
    file: Option<BufWriter<File>>,
    current_size: u64,
    /// Start of the period the current file covers
    period_start: DateTime<Local>,
}

impl StreamWriter {
    fn new(path: PathBuf, rotation: Rotation) -> Self {
        Self {
            path,
            rotation,
            file: None,
            current_size: 0,
            period_start: Local::now(),
        }
    }

    fn open_file(&mut self, now: DateTime<Local>) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log file: {}", self.path.display()))?;

        let metadata = file.metadata().ok();
        self.current_size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);

        // A file left over from an earlier run covers the period it was last written in
        self.period_start = match metadata.and_then(|m| m.modified().ok()) {
            Some(modified) if self.current_size > 0 => DateTime::<Local>::from(modified),
            _ => now,
        };

        self.file = Some(BufWriter::new(file));
        debug!("Opened log file: {}", self.path.display());
        Ok(())
    }

    fn write_line_at(&mut self, line: &str, now: DateTime<Local>) -> Result<()> {
        if self.file.is_none() {
            self.open_file(now)?;
        }

        let len = line.len() as u64 + 1;
        if self.should_rotate(len, now) {
            self.rotate(now)?;
        }

        if let Some(ref mut writer) = self.file {
            let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
            if let Err(e) = result {
                // Reopen on the next line
                self.file = None;
                return Err(e)
                    .with_context(|| format!("Failed to write log file: {}", self.path.display()));
            }
            self.current_size += len;
        }

        Ok(())
    }

    fn should_rotate(&self, incoming: u64, now: DateTime<Local>) -> bool {
        match self.rotation {
            Rotation::BySize { max_bytes, .. } => {
                self.current_size > 0 && self.current_size + incoming > max_bytes
            }
            Rotation::ByInterval { interval } => {
                let interval = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
                self.current_size > 0 && now - self.period_start >= interval
            }
        }
    }

    fn rotate(&mut self, now: DateTime<Local>) -> Result<()> {
        if let Some(mut writer) = self.file.take() {
            let _ = writer.flush();
        }

        match self.rotation {
            Rotation::BySize { max_files, .. } => self.shift_backups(max_files),
            Rotation::ByInterval { .. } => {
                let suffix = self.period_start.format(INTERVAL_SUFFIX_FORMAT).to_string();
                let target = unique_path(&suffixed_path(&self.path, &suffix));
                std::fs::rename(&self.path, &target).with_context(|| {
                    format!("Failed to rotate log file to {}", target.display())
                })?;
            }
        }

        debug!("Rotated log file: {}", self.path.display());
        self.open_file(now)
    }

    /// `file.N-1` -> `file.N`, ..., `file` -> `file.1`; the oldest falls off
    fn shift_backups(&self, max_files: u32) {
        let oldest = suffixed_path(&self.path, &max_files.to_string());
        if oldest.exists() {
            std::fs::remove_file(&oldest).ok();
        }

        for i in (1..max_files).rev() {
            let old_path = suffixed_path(&self.path, &i.to_string());
            if old_path.exists() {
                let new_path = suffixed_path(&self.path, &(i + 1).to_string());
                std::fs::rename(&old_path, &new_path).ok();
            }
        }

        if self.path.exists() {
            std::fs::rename(&self.path, suffixed_path(&self.path, "1")).ok();
        }
    }

    fn run(mut self, receiver: Receiver<String>) {
        // recv_blocking keeps returning queued lines after the sender closes
        while let Ok(line) = receiver.recv_blocking() {
            if let Err(e) = self.write_line_at(&line, Local::now()) {
                error!("{:#}", e);
            }
        }

        if let Some(ref mut writer) = self.file {
            let _ = writer.flush();
        }
        debug!("Log writer for {} stopped", self.path.display());
    }
}

fn suffixed_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    base.with_file_name(name)
}

/// `path`, or `path.1`, `path.2`, ... if it is taken
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    (1u32..)
        .map(|n| suffixed_path(path, &n.to_string()))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
