//! Device transport capability interface
//!
//! The session only needs a handful of operations from the transport:
//! enumerate by VID/PID, open, send an output report, read an input report,
//! query presence and close. [`crate::usb::device`] implements them on top
//! of libusb; tests use the in-memory meter from `test_utils`, built with
//! the `test-utils` feature.

use protocol::DeviceIdentity;
use std::fmt;
use std::time::Duration;

use super::error::{DeviceError, ReadError};

/// Enumeration record for a matching device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl fmt::Display for HidDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: {:04x}:{:04x} {} {}",
            self.bus_number,
            self.address,
            self.vendor_id,
            self.product_id,
            self.manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            self.product.as_deref().unwrap_or("Unknown Product")
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " (serial {})", serial)?;
        }
        Ok(())
    }
}

/// Finds and opens devices
pub trait HidTransport: Send {
    type Connection: HidConnection + 'static;

    /// All attached devices matching `identity`, in bus order
    fn enumerate(&self, identity: DeviceIdentity) -> Result<Vec<HidDeviceInfo>, DeviceError>;

    /// Open a previously enumerated device
    ///
    /// On failure any partially acquired handle must already be released.
    fn open(&self, device: &HidDeviceInfo) -> Result<Self::Connection, DeviceError>;
}

/// An open device handle
///
/// Shared between the polling thread (writes) and the reader thread
/// (reads), hence `&self` everywhere.
pub trait HidConnection: Send + Sync {
    /// Send one output report; `report[0]` is the report id
    ///
    /// Must give up after a bounded timeout with [`DeviceError::WriteTimeout`].
    fn write_report(&self, report: &[u8]) -> Result<usize, DeviceError>;

    /// Wait up to `timeout` for the next input report
    ///
    /// Returns `Ok(None)` on timeout. Reports are returned with the leading
    /// report id byte.
    fn read_report(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ReadError>;

    /// Whether the device is still attached
    fn is_plugged(&self) -> bool;

    /// Release the handle; called at most once by the session
    fn close(&self) -> Result<(), DeviceError>;
}
