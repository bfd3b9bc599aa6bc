//! GM1356 sound level meter logger
//!
//! Library half of the `gm1356-logger` binary: configuration, the USB HID
//! transport and device session, the two-stream sample sink and the capture
//! loop tying them together.

pub mod capture;
pub mod config;
pub mod sink;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use capture::{CaptureLoop, CaptureOptions, CaptureSummary, finish_run};
pub use config::LoggerConfig;
pub use sink::SampleSink;
