//! Device and transport error types

use thiserror::Error;

/// Errors raised while finding, opening or talking to the meter
///
/// Every variant is fatal to a capture run; there is no reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// No attached device matched the requested identity
    #[error("No device found matching {vendor_id:04x}:{product_id:04x}")]
    NotFound { vendor_id: u16, product_id: u16 },

    /// The USB context could not be created or the bus listed
    #[error("USB enumeration failed: {0}")]
    Enumeration(String),

    /// Device present but the handle or interface could not be acquired
    #[error("Could not open usb device: {0}")]
    OpenFailed(String),

    /// Poll command not accepted within the transport write timeout
    #[error("USB write timed out")]
    WriteTimeout,

    /// Poll command failed for any other reason
    #[error("USB write failed: {0}")]
    WriteFailed(String),

    /// Operation on a session that has already been stopped or closed
    #[error("Device session is not open")]
    NotOpen,

    /// Releasing the handle failed (only ever logged)
    #[error("Could not close usb device: {0}")]
    CloseFailed(String),
}

/// Errors from a single input report read
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The device left the bus
    #[error("Device disconnected")]
    Disconnected,

    #[error("USB read failed: {0}")]
    Failed(String),
}

/// Map a rusb error raised while opening the device
pub fn map_open_error(e: rusb::Error) -> DeviceError {
    match e {
        rusb::Error::NotFound | rusb::Error::NoDevice => {
            DeviceError::OpenFailed("device disappeared before it could be opened".to_string())
        }
        rusb::Error::Access => DeviceError::OpenFailed(
            "permission denied (check udev rules or run with elevated privileges)".to_string(),
        ),
        rusb::Error::Busy => {
            DeviceError::OpenFailed("interface is busy (claimed by another program)".to_string())
        }
        other => DeviceError::OpenFailed(other.to_string()),
    }
}

/// Map a rusb error raised while sending an output report
pub fn map_write_error(e: rusb::Error) -> DeviceError {
    match e {
        rusb::Error::Timeout => DeviceError::WriteTimeout,
        rusb::Error::NoDevice => DeviceError::WriteFailed("device disconnected".to_string()),
        other => DeviceError::WriteFailed(other.to_string()),
    }
}

/// Map a rusb error raised while reading an input report
pub fn map_read_error(e: rusb::Error) -> ReadError {
    match e {
        rusb::Error::NoDevice => ReadError::Disconnected,
        other => ReadError::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_timeout_is_distinct() {
        assert_eq!(map_write_error(rusb::Error::Timeout), DeviceError::WriteTimeout);
        assert!(matches!(
            map_write_error(rusb::Error::Pipe),
            DeviceError::WriteFailed(_)
        ));
        assert!(matches!(
            map_write_error(rusb::Error::NoDevice),
            DeviceError::WriteFailed(_)
        ));
    }

    #[test]
    fn test_open_error_mapping() {
        match map_open_error(rusb::Error::Access) {
            DeviceError::OpenFailed(msg) => assert!(msg.contains("permission denied")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            map_open_error(rusb::Error::Io),
            DeviceError::OpenFailed(_)
        ));
    }

    #[test]
    fn test_read_error_mapping() {
        assert_eq!(map_read_error(rusb::Error::NoDevice), ReadError::Disconnected);
        assert!(matches!(
            map_read_error(rusb::Error::Overflow),
            ReadError::Failed(_)
        ));
    }

    #[test]
    fn test_not_found_display() {
        let err = DeviceError::NotFound {
            vendor_id: 0x64BD,
            product_id: 0x74E3,
        };
        assert_eq!(err.to_string(), "No device found matching 64bd:74e3");
    }
}
