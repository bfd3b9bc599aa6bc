//! Capture loop
//!
//! Opens the meter, sends a poll command every interval and stops when the
//! operator asks or the device goes away. Samples arrive on the session's
//! reader thread and are decoded and recorded there; this loop only paces
//! the polls.

use anyhow::Context;
use chrono::Local;
use common::{StopReason, StopSignal};
use protocol::{DeviceIdentity, RawReport, decode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{LoggerConfig, MIN_POLL_INTERVAL_MS};
use crate::sink::SampleSink;
use crate::usb::{DEFAULT_READ_TIMEOUT, DeviceError, DeviceSession, HidTransport, ReportHandler};

/// Shortest pause between two poll commands
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(MIN_POLL_INTERVAL_MS);

/// Parameters of one capture run
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub identity: DeviceIdentity,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    /// Stop after this many polls
    pub max_samples: Option<u64>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::GM1356,
            poll_interval: MIN_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_samples: None,
        }
    }
}

impl CaptureOptions {
    pub fn from_config(config: &LoggerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            identity: config.device.identity()?,
            poll_interval: config.capture.poll_interval(),
            read_timeout: config.device.read_timeout(),
            max_samples: None,
        })
    }

    /// Poll interval, never below [`MIN_POLL_INTERVAL`]
    pub fn effective_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

/// Counters shared with the report handler
#[derive(Debug, Default)]
pub struct ReportStats {
    received: AtomicU64,
    discarded: AtomicU64,
}

impl ReportStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// How a run that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub reason: StopReason,
    pub polls_sent: u64,
    /// Well-formed reports decoded and handed to the sink
    pub reports_received: u64,
    /// Reports dropped for having the wrong length
    pub reports_discarded: u64,
}

/// Report handler for the reader thread: validate, decode, echo, record
///
/// Wrong-length reports are logged and dropped; they never end the run.
pub fn report_handler(sink: Arc<SampleSink>, stats: Arc<ReportStats>) -> ReportHandler {
    Box::new(move |bytes: &[u8]| {
        let raw = match RawReport::try_from(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                stats.discarded.fetch_add(1, Ordering::Relaxed);
                warn!("{}: {:?}", e, bytes);
                sink.note(&format!("Discarded report : {} : {:?}", e, bytes));
                return;
            }
        };

        let measurement = decode(&raw, Local::now());
        stats.received.fetch_add(1, Ordering::Relaxed);
        info!(
            "{} {} {}",
            measurement.timestamp_display(),
            measurement.level_display(),
            measurement.unit
        );
        sink.record(&raw, &measurement);
    })
}

/// Drives one capture run against a transport
pub struct CaptureLoop<T: HidTransport> {
    transport: T,
    sink: Arc<SampleSink>,
    stop: StopSignal,
    options: CaptureOptions,
}

impl<T: HidTransport> CaptureLoop<T> {
    pub fn new(
        transport: T,
        sink: Arc<SampleSink>,
        stop: StopSignal,
        options: CaptureOptions,
    ) -> Self {
        Self {
            transport,
            sink,
            stop,
            options,
        }
    }

    /// Run until stopped, unplugged or failed
    ///
    /// Every path out of here has closed the device handle. Errors are also
    /// written to the diagnostic log before they are returned.
    pub fn run(&self) -> Result<CaptureSummary, DeviceError> {
        self.sink.note("Capturing data started ...");

        let stats = Arc::new(ReportStats::default());
        let handler = report_handler(Arc::clone(&self.sink), Arc::clone(&stats));

        let mut session = match DeviceSession::open(
            &self.transport,
            self.options.identity,
            self.options.read_timeout,
            handler,
        ) {
            Ok(session) => session,
            Err(e) => {
                error!("{}", e);
                self.sink.note(&e.to_string());
                self.sink.note("Exit");
                return Err(e);
            }
        };
        self.sink.note(&session.device().to_string());

        let interval = self.options.effective_interval();
        info!("Waiting for data (one poll every {:?})...", interval);

        let reason = loop {
            if self.stop.is_triggered() {
                break StopReason::OperatorRequested;
            }
            if !session.is_plugged() {
                break StopReason::DeviceUnplugged;
            }
            if let Some(limit) = self.options.max_samples
                && session.polls_sent() >= limit
            {
                info!("Sample limit of {} reached", limit);
                break StopReason::OperatorRequested;
            }

            if let Err(e) = session.poll() {
                error!("{}", e);
                self.sink.note(&e.to_string());
                session.close();
                self.sink.note("Exit");
                return Err(e);
            }

            self.stop.sleep(interval);
        };

        session.stop();
        let polls_sent = session.polls_sent();
        // Joins the reader, so every delivered report has been counted
        session.close();

        match reason {
            StopReason::DeviceUnplugged => warn!("Stopped capturing : {}", reason),
            StopReason::OperatorRequested => info!("Stopped capturing : {}", reason),
        }
        self.sink.note(&format!("Stopped capturing : {}", reason));

        Ok(CaptureSummary {
            reason,
            polls_sent,
            reports_received: stats.received(),
            reports_discarded: stats.discarded(),
        })
    }
}

/// Close out a run: final note, flush both logs, map the outcome for `main`
///
/// A run that ended on a stop reason is a success and is followed by a
/// "Script ended" note. A device error becomes the process error, so the
/// binary exits nonzero; [`CaptureLoop::run`] has already noted "Exit".
pub fn finish_run(
    sink: &SampleSink,
    result: Result<CaptureSummary, DeviceError>,
) -> anyhow::Result<CaptureSummary> {
    match result {
        Ok(summary) => {
            info!(
                "{} polls sent, {} samples recorded, {} reports discarded",
                summary.polls_sent, summary.reports_received, summary.reports_discarded
            );
            sink.note("Script ended");
            sink.shutdown();
            Ok(summary)
        }
        Err(e) => {
            sink.shutdown();
            Err(e).context("Capture failed")
        }
    }
}
