//! Report decoding
//!
//! Pure functions turning a [`RawReport`] into a [`Measurement`]. Nothing in
//! here performs I/O or fails: length checking happens when the
//! [`RawReport`] is built.
//!
//! Status byte (`report[3]`) layout:
//!
//! ```text
//!   0b000x_0000  0x10  1 = dB C, 0 = dB A
//!   0b00x0_0000  0x20  1 = max lock on
//!   0b0x00_0000  0x40  1 = fast, 0 = slow
//!   0b0000_0xxx        range, see `range`
//! ```

use chrono::{DateTime, Local};

use crate::types::{MaxLock, Measurement, REPORT_LEN, Range, RawReport, ResponseSpeed, Weighting};

/// Output report that asks the meter for one sample
///
/// Byte 0 is the (unnumbered) report id.
pub const POLL_COMMAND: [u8; REPORT_LEN] = [0x00, 0xB3, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

const WEIGHTING_C: u8 = 0x10;
const MAX_LOCK_ON: u8 = 0x20;
const SPEED_FAST: u8 = 0x40;

/// Decode a report captured at `timestamp`
pub fn decode(report: &RawReport, timestamp: DateTime<Local>) -> Measurement {
    let status = report.status();
    Measurement {
        timestamp,
        level_db: level_db(report.level_high(), report.level_low()),
        unit: weighting(status),
        response_speed: response_speed(status),
        max_lock: max_lock(status),
        range: range(status),
    }
}

/// Sound level in dB from the two level bytes (tenths of a dB, big endian)
pub fn level_db(high: u8, low: u8) -> f64 {
    (u16::from(high) * 256 + u16::from(low)) as f64 * 0.1
}

pub fn weighting(status: u8) -> Weighting {
    if status & WEIGHTING_C == WEIGHTING_C {
        Weighting::C
    } else {
        Weighting::A
    }
}

pub fn max_lock(status: u8) -> MaxLock {
    if status & MAX_LOCK_ON == MAX_LOCK_ON {
        MaxLock::On
    } else {
        MaxLock::Off
    }
}

pub fn response_speed(status: u8) -> ResponseSpeed {
    if status & SPEED_FAST == SPEED_FAST {
        ResponseSpeed::Fast
    } else {
        ResponseSpeed::Slow
    }
}

/// Range from the low three bits
///
/// First match wins, in the meter's priority order rather than numeric
/// order: `0x07` is 80 - 130.
pub fn range(status: u8) -> Range {
    if status & 0x04 == 0x04 {
        Range::R80_130
    } else if status & 0x03 == 0x03 {
        Range::R60_110
    } else if status & 0x02 == 0x02 {
        Range::R50_100
    } else if status & 0x01 == 0x01 {
        Range::R30_80
    } else {
        Range::R30_130
    }
}
