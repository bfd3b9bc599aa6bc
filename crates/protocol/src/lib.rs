//! Report protocol for the GM1356 sound level meter
//!
//! This crate defines the fixed 9-byte report exchanged with the meter, the
//! poll command that requests a sample, and the pure decoder that turns an
//! input report into a [`Measurement`].
//!
//! # Example
//!
//! ```
//! use protocol::{RawReport, Range, ResponseSpeed, Weighting, decode};
//!
//! let bytes = [0x00, 0x01, 0x2C, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00];
//! let report = RawReport::try_from(&bytes[..]).unwrap();
//!
//! let measurement = decode(&report, chrono::Local::now());
//! assert_eq!(measurement.level_display(), "30.0");
//! assert_eq!(measurement.unit, Weighting::A);
//! assert_eq!(measurement.response_speed, ResponseSpeed::Fast);
//! assert_eq!(measurement.range, Range::R30_130);
//! ```

pub mod error;
pub mod report;
pub mod types;

pub use error::{ProtocolError, Result};
pub use report::{POLL_COMMAND, decode, level_db, max_lock, range, response_speed, weighting};
pub use types::{
    DeviceIdentity, MaxLock, Measurement, REPORT_LEN, Range, RawReport, ResponseSpeed, Weighting,
};
