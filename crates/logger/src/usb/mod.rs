//! USB subsystem
//!
//! Finds the meter on the bus, owns the open handle, sends poll commands and
//! delivers input reports from a dedicated reader thread.
//!
//! - [`transport`]: capability traits the session is written against
//! - [`device`]: libusb implementation of those traits
//! - [`session`]: session lifecycle, polling and the reader thread

pub mod device;
pub mod error;
pub mod session;
pub mod transport;

pub use device::{DEFAULT_WRITE_TIMEOUT, RusbConnection, RusbTransport};
pub use error::{DeviceError, ReadError};
pub use session::{DEFAULT_READ_TIMEOUT, DeviceSession, ReportHandler, SessionState};
pub use transport::{HidConnection, HidDeviceInfo, HidTransport};
