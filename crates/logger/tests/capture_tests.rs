//! End-to-end capture runs against the mock meter
//!
//! Covers the full pipeline: session open, polling cadence, reader thread,
//! decoding and both log files.

use common::{StopReason, StopSignal};
use logger::config::StorageSettings;
use logger::test_utils::{DEFAULT_MOCK_REPORT, MockMeter, MockTransport};
use logger::usb::DeviceError;
use logger::{CaptureLoop, CaptureOptions, SampleSink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    settings: StorageSettings,
    sink: Arc<SampleSink>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let settings = StorageSettings {
            log_dir: dir.path().to_string_lossy().into_owned(),
            ..StorageSettings::default()
        };
        let sink = Arc::new(SampleSink::new(&settings).unwrap());
        Self {
            _dir: dir,
            settings,
            sink,
        }
    }

    fn capture(&self, transport: MockTransport, stop: StopSignal) -> CaptureLoop<MockTransport> {
        CaptureLoop::new(
            transport,
            Arc::clone(&self.sink),
            stop,
            CaptureOptions::default(),
        )
    }

    /// Flush the writers and return (csv lines, diagnostic lines)
    fn finish(&self) -> (Vec<String>, Vec<String>) {
        self.sink.shutdown();
        let read = |path: std::path::PathBuf| -> Vec<String> {
            std::fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        };
        (
            read(self.settings.csv_path()),
            read(self.settings.raw_path()),
        )
    }
}

#[test]
fn test_ten_polls_then_unplug() {
    let harness = Harness::new();
    let meter = MockMeter::new().unplug_after(10);
    let capture = harness.capture(MockTransport::with_meter(meter.clone()), StopSignal::new());

    let summary = capture.run().unwrap();
    let (csv, diagnostic) = harness.finish();

    assert_eq!(summary.reason, StopReason::DeviceUnplugged);
    assert_eq!(summary.polls_sent, 10);
    assert_eq!(summary.reports_received, 10);
    assert_eq!(meter.writes().len(), 10);
    assert_eq!(meter.close_count(), 1);

    assert_eq!(csv.len(), 10);
    for line in &csv {
        assert!(line.ends_with(",30.0,dB A"), "unexpected line: {}", line);
    }

    assert!(diagnostic[0].ends_with(",Capturing data started ..."));
    let samples: Vec<_> = diagnostic
        .iter()
        .filter(|l| l.ends_with(&format!("{:?}", DEFAULT_MOCK_REPORT)))
        .collect();
    assert_eq!(samples.len(), 10);
    assert!(
        diagnostic
            .last()
            .unwrap()
            .ends_with(",Stopped capturing : Device unplugged")
    );
}

#[test]
fn test_operator_stop_wakes_the_loop() {
    let harness = Harness::new();
    let meter = MockMeter::new();
    let stop = StopSignal::new();
    let capture = harness.capture(MockTransport::with_meter(meter.clone()), stop.clone());

    let started = Instant::now();
    let runner = std::thread::spawn(move || capture.run());
    std::thread::sleep(Duration::from_millis(200));
    stop.trigger();

    let summary = runner.join().unwrap().unwrap();
    let (csv, diagnostic) = harness.finish();

    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(summary.reason, StopReason::OperatorRequested);
    assert_eq!(summary.polls_sent, 1);
    assert_eq!(csv.len(), 1);
    assert!(
        diagnostic
            .last()
            .unwrap()
            .ends_with(",Stopped capturing : Operator requested stop")
    );
}

#[test]
fn test_malformed_reports_are_discarded() {
    let harness = Harness::new();
    let meter = MockMeter::new()
        .with_script(vec![
            vec![0x00, 0x01, 0x2C],
            DEFAULT_MOCK_REPORT.to_vec(),
            vec![0u8; 12],
        ])
        .unplug_after(3);
    let capture = harness.capture(MockTransport::with_meter(meter), StopSignal::new());

    let summary = capture.run().unwrap();
    let (csv, diagnostic) = harness.finish();

    assert_eq!(summary.reason, StopReason::DeviceUnplugged);
    assert_eq!(summary.polls_sent, 3);
    assert_eq!(summary.reports_received, 1);
    assert_eq!(summary.reports_discarded, 2);
    assert_eq!(csv.len(), 1);
    assert_eq!(
        diagnostic
            .iter()
            .filter(|l| l.contains("Discarded report"))
            .count(),
        2
    );
}

#[test]
fn test_open_failure_is_reported() {
    let harness = Harness::new();
    let meter = MockMeter::new();
    let transport = MockTransport::failing_open(
        meter.clone(),
        DeviceError::OpenFailed("permission denied".to_string()),
    );
    let capture = harness.capture(transport, StopSignal::new());

    let result = capture.run();
    let (csv, diagnostic) = harness.finish();

    assert!(matches!(result, Err(DeviceError::OpenFailed(_))));
    assert!(meter.writes().is_empty());
    assert!(csv.is_empty());
    assert!(diagnostic.iter().any(|l| l.contains("permission denied")));
    assert!(diagnostic.last().unwrap().ends_with(",Exit"));
}

#[test]
fn test_write_failure_after_samples() {
    let harness = Harness::new();
    let meter = MockMeter::new()
        .fail_write_after(2, DeviceError::WriteFailed("pipe error".to_string()));
    let capture = harness.capture(MockTransport::with_meter(meter.clone()), StopSignal::new());

    let result = capture.run();
    let (csv, diagnostic) = harness.finish();

    assert_eq!(
        result,
        Err(DeviceError::WriteFailed("pipe error".to_string()))
    );
    assert_eq!(meter.close_count(), 1);
    assert_eq!(csv.len(), 2);
    assert!(diagnostic.iter().any(|l| l.contains("USB write failed: pipe error")));
}

#[tokio::test]
async fn test_timer_stop_from_async_runtime() {
    let harness = Harness::new();
    let stop = StopSignal::new();
    let capture = harness.capture(MockTransport::with_meter(MockMeter::new()), stop.clone());

    let timer = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(700)).await;
        timer.trigger();
    });

    let summary = tokio::task::spawn_blocking(move || capture.run())
        .await
        .unwrap()
        .unwrap();
    let (csv, _) = harness.finish();

    assert_eq!(summary.reason, StopReason::OperatorRequested);
    assert_eq!(summary.polls_sent, 2);
    assert_eq!(csv.len(), 2);
}
