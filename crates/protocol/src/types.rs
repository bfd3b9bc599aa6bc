//! Report and measurement type definitions
//!
//! This module defines the fixed-size input report delivered by the meter,
//! the identity used to find the device on the bus, and the decoded
//! measurement with its status-byte enums.

use chrono::{DateTime, Local};
use std::fmt;

use crate::error::ProtocolError;

/// Length of every report exchanged with the meter, report id included
pub const REPORT_LEN: usize = 9;

/// Vendor/product pair identifying the target hardware class
///
/// Used only to filter the enumerated USB devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl DeviceIdentity {
    /// Benetech GM1356 digital sound level meter
    pub const GM1356: DeviceIdentity = DeviceIdentity {
        vendor_id: 0x64BD,
        product_id: 0x74E3,
    };

    /// Check whether a descriptor's VID/PID belongs to this identity
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::GM1356
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Input report as delivered by the transport layer
///
/// Byte 0 is the HID report id, bytes 1-2 carry the level and byte 3 is the
/// status byte. The remaining bytes are not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawReport([u8; REPORT_LEN]);

impl RawReport {
    /// Wrap an already fixed-size buffer
    pub const fn new(bytes: [u8; REPORT_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the report
    pub fn bytes(&self) -> &[u8; REPORT_LEN] {
        &self.0
    }

    /// High byte of the level reading
    pub fn level_high(&self) -> u8 {
        self.0[1]
    }

    /// Low byte of the level reading
    pub fn level_low(&self) -> u8 {
        self.0[2]
    }

    /// Mode/status bitfield
    pub fn status(&self) -> u8 {
        self.0[3]
    }
}

impl TryFrom<&[u8]> for RawReport {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let fixed: [u8; REPORT_LEN] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::MalformedReport {
                    expected: REPORT_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(fixed))
    }
}

/// Frequency weighting selected on the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Weighting {
    /// dB A
    A,
    /// dB C
    C,
}

impl Weighting {
    pub fn label(&self) -> &'static str {
        match self {
            Weighting::A => "dB A",
            Weighting::C => "dB C",
        }
    }
}

/// Time response of the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseSpeed {
    /// No filtering
    Fast,
    /// Filtered
    Slow,
}

impl ResponseSpeed {
    pub fn label(&self) -> &'static str {
        match self {
            ResponseSpeed::Fast => "Fast",
            ResponseSpeed::Slow => "Slow",
        }
    }
}

/// Whether the display latches the highest reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaxLock {
    On,
    Off,
}

impl MaxLock {
    pub fn label(&self) -> &'static str {
        match self {
            MaxLock::On => "Max lock on",
            MaxLock::Off => "Max lock off",
        }
    }
}

/// Measurement range, in dB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Range {
    /// 30 - 130 dB (auto)
    R30_130,
    /// 30 - 80 dB
    R30_80,
    /// 50 - 100 dB
    R50_100,
    /// 60 - 110 dB
    R60_110,
    /// 80 - 130 dB
    R80_130,
}

impl Range {
    pub fn label(&self) -> &'static str {
        match self {
            Range::R30_130 => "30 - 130",
            Range::R30_80 => "30 - 80",
            Range::R50_100 => "50 - 100",
            Range::R60_110 => "60 - 110",
            Range::R80_130 => "80 - 130",
        }
    }
}

macro_rules! display_via_label {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.label())
                }
            }
        )*
    };
}

display_via_label!(Weighting, ResponseSpeed, MaxLock, Range);

/// A decoded sample
///
/// Built once by the decoder and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Capture time (millisecond precision when formatted)
    pub timestamp: DateTime<Local>,
    /// Sound level at full precision; use [`Measurement::level_display`] for output
    pub level_db: f64,
    pub unit: Weighting,
    pub response_speed: ResponseSpeed,
    pub max_lock: MaxLock,
    pub range: Range,
}

impl Measurement {
    /// Level rounded to one decimal place
    pub fn level_rounded(&self) -> f64 {
        (self.level_db * 10.0).round() / 10.0
    }

    /// Level formatted with one decimal place
    pub fn level_display(&self) -> String {
        format!("{:.1}", self.level_db)
    }

    /// Capture time as `YYYY-MM-DD HH:MM:SS.mmm`
    pub fn timestamp_display(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_report_from_slice() {
        let bytes = [0u8, 1, 2, 3, 4, 5, 6, 7, 8];
        let report = RawReport::try_from(&bytes[..]).unwrap();
        assert_eq!(report.level_high(), 1);
        assert_eq!(report.level_low(), 2);
        assert_eq!(report.status(), 3);
        assert_eq!(report.bytes(), &bytes);
    }

    #[test]
    fn test_raw_report_rejects_wrong_length() {
        let short = [0u8; 8];
        match RawReport::try_from(&short[..]) {
            Err(ProtocolError::MalformedReport { expected, actual }) => {
                assert_eq!(expected, REPORT_LEN);
                assert_eq!(actual, 8);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let long = [0u8; 64];
        assert!(RawReport::try_from(&long[..]).is_err());
        assert!(RawReport::try_from(&[][..]).is_err());
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(DeviceIdentity::GM1356.to_string(), "64bd:74e3");
        assert!(DeviceIdentity::GM1356.matches(0x64BD, 0x74E3));
        assert!(!DeviceIdentity::GM1356.matches(0x64BD, 0x0000));
    }

    #[test]
    fn test_labels() {
        assert_eq!(Weighting::C.to_string(), "dB C");
        assert_eq!(ResponseSpeed::Slow.to_string(), "Slow");
        assert_eq!(MaxLock::On.to_string(), "Max lock on");
        assert_eq!(Range::R50_100.to_string(), "50 - 100");
    }
}
