//! Test utilities for gm1356-logger
//!
//! An in-memory meter that implements the transport traits, so sessions and
//! capture runs can be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use logger::test_utils::{MockMeter, MockTransport};
//! use logger::usb::{HidTransport, HidConnection};
//! use protocol::{DeviceIdentity, POLL_COMMAND};
//! use std::time::Duration;
//!
//! let meter = MockMeter::new();
//! let transport = MockTransport::with_meter(meter.clone());
//!
//! let devices = transport.enumerate(DeviceIdentity::GM1356).unwrap();
//! let connection = transport.open(&devices[0]).unwrap();
//! connection.write_report(&POLL_COMMAND).unwrap();
//!
//! let report = connection.read_report(Duration::from_millis(10)).unwrap();
//! assert_eq!(report.unwrap().len(), 9);
//! ```

use protocol::{DeviceIdentity, REPORT_LEN};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::usb::{DeviceError, HidConnection, HidDeviceInfo, HidTransport, ReadError};

/// Report answered to every poll unless a script says otherwise:
/// 30.0 dB A, fast, max lock off, range 30 - 130
pub const DEFAULT_MOCK_REPORT: [u8; REPORT_LEN] =
    [0x00, 0x01, 0x2C, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Build an enumeration record for a mock device
pub fn create_mock_device_info(address: u8, identity: DeviceIdentity) -> HidDeviceInfo {
    HidDeviceInfo {
        vendor_id: identity.vendor_id,
        product_id: identity.product_id,
        bus_number: 1,
        address,
        manufacturer: Some("Mock Manufacturer".to_string()),
        product: Some("Mock Sound Level Meter".to_string()),
        serial_number: None,
    }
}

struct MockInner {
    info: HidDeviceInfo,
    /// Reports waiting to be read
    pending: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    /// Answers for upcoming polls, in order
    script: Mutex<VecDeque<Vec<u8>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    unplug_after: Mutex<Option<usize>>,
    fail_write: Mutex<Option<(usize, DeviceError)>>,
    plugged: AtomicBool,
    close_count: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated meter: every poll command queues one input report
#[derive(Clone)]
pub struct MockMeter {
    inner: Arc<MockInner>,
}

impl Default for MockMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMeter {
    pub fn new() -> Self {
        Self::with_identity(DeviceIdentity::GM1356)
    }

    /// Meter with a different VID/PID
    pub fn with_identity(identity: DeviceIdentity) -> Self {
        Self {
            inner: Arc::new(MockInner {
                info: create_mock_device_info(1, identity),
                pending: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                script: Mutex::new(VecDeque::new()),
                writes: Mutex::new(Vec::new()),
                unplug_after: Mutex::new(None),
                fail_write: Mutex::new(None),
                plugged: AtomicBool::new(true),
                close_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Answer the first polls with these reports, then with the default one
    pub fn with_script(self, reports: Vec<Vec<u8>>) -> Self {
        lock(&self.inner.script).extend(reports);
        self
    }

    /// Report the device as unplugged once `writes` polls have been answered
    pub fn unplug_after(self, writes: usize) -> Self {
        *lock(&self.inner.unplug_after) = Some(writes);
        self
    }

    /// Fail every write after `writes` successful ones
    pub fn fail_write_after(self, writes: usize, error: DeviceError) -> Self {
        *lock(&self.inner.fail_write) = Some((writes, error));
        self
    }

    pub fn info(&self) -> &HidDeviceInfo {
        &self.inner.info
    }

    /// Pull the device off the simulated bus
    pub fn unplug(&self) {
        self.inner.plugged.store(false, Ordering::Release);
    }

    /// Push an unsolicited report, as if the device sent it on its own
    pub fn push_report(&self, report: Vec<u8>) {
        lock(&self.inner.pending).push_back(report);
        self.inner.ready.notify_all();
    }

    /// Output reports received so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.writes).clone()
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::Acquire)
    }
}

/// Transport exposing zero or more mock meters
pub struct MockTransport {
    meters: Vec<MockMeter>,
    open_error: Option<DeviceError>,
}

impl MockTransport {
    /// Nothing attached
    pub fn empty() -> Self {
        Self {
            meters: Vec::new(),
            open_error: None,
        }
    }

    pub fn with_meter(meter: MockMeter) -> Self {
        Self {
            meters: vec![meter],
            open_error: None,
        }
    }

    /// Device enumerates but opening it fails with `error`
    pub fn failing_open(meter: MockMeter, error: DeviceError) -> Self {
        Self {
            meters: vec![meter],
            open_error: Some(error),
        }
    }
}

impl HidTransport for MockTransport {
    type Connection = MockConnection;

    fn enumerate(&self, identity: DeviceIdentity) -> Result<Vec<HidDeviceInfo>, DeviceError> {
        Ok(self
            .meters
            .iter()
            .filter(|m| identity.matches(m.info().vendor_id, m.info().product_id))
            .filter(|m| m.inner.plugged.load(Ordering::Acquire))
            .map(|m| m.info().clone())
            .collect())
    }

    fn open(&self, device: &HidDeviceInfo) -> Result<MockConnection, DeviceError> {
        if let Some(error) = &self.open_error {
            return Err(error.clone());
        }

        self.meters
            .iter()
            .find(|m| m.info() == device)
            .map(|m| MockConnection { meter: m.clone() })
            .ok_or(DeviceError::NotFound {
                vendor_id: device.vendor_id,
                product_id: device.product_id,
            })
    }
}

/// Open handle on a [`MockMeter`]
pub struct MockConnection {
    meter: MockMeter,
}

impl HidConnection for MockConnection {
    fn write_report(&self, report: &[u8]) -> Result<usize, DeviceError> {
        let inner = &self.meter.inner;

        if !inner.plugged.load(Ordering::Acquire) {
            return Err(DeviceError::WriteFailed("device disconnected".to_string()));
        }

        let failure = lock(&inner.fail_write).clone();
        let mut writes = lock(&inner.writes);
        if let Some((limit, error)) = failure
            && writes.len() >= limit
        {
            return Err(error);
        }
        writes.push(report.to_vec());
        let count = writes.len();
        drop(writes);

        let answer = lock(&inner.script)
            .pop_front()
            .unwrap_or_else(|| DEFAULT_MOCK_REPORT.to_vec());
        self.meter.push_report(answer);

        if lock(&inner.unplug_after).is_some_and(|limit| count >= limit) {
            self.meter.unplug();
        }

        Ok(report.len())
    }

    fn read_report(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ReadError> {
        let inner = &self.meter.inner;
        let pending = lock(&inner.pending);

        let (mut pending, _) = inner
            .ready
            .wait_timeout_while(pending, timeout, |queue| queue.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(pending.pop_front())
    }

    fn is_plugged(&self) -> bool {
        self.meter.inner.plugged.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<(), DeviceError> {
        self.meter.inner.close_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_filters_by_identity() {
        let transport = MockTransport::with_meter(MockMeter::new());
        assert_eq!(transport.enumerate(DeviceIdentity::GM1356).unwrap().len(), 1);

        let other = DeviceIdentity {
            vendor_id: 0x1234,
            product_id: 0x5678,
        };
        assert!(transport.enumerate(other).unwrap().is_empty());
    }

    #[test]
    fn test_scripted_answers_then_default() {
        let meter = MockMeter::new().with_script(vec![vec![0x00, 0x02]]);
        let transport = MockTransport::with_meter(meter);
        let info = transport.enumerate(DeviceIdentity::GM1356).unwrap().remove(0);
        let connection = transport.open(&info).unwrap();

        connection.write_report(&[0x00, 0xB3]).unwrap();
        connection.write_report(&[0x00, 0xB3]).unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(
            connection.read_report(timeout).unwrap(),
            Some(vec![0x00, 0x02])
        );
        assert_eq!(
            connection.read_report(timeout).unwrap(),
            Some(DEFAULT_MOCK_REPORT.to_vec())
        );
        assert_eq!(connection.read_report(timeout).unwrap(), None);
    }

    #[test]
    fn test_unplug_after_writes() {
        let meter = MockMeter::new().unplug_after(2);
        let transport = MockTransport::with_meter(meter);
        let info = transport.enumerate(DeviceIdentity::GM1356).unwrap().remove(0);
        let connection = transport.open(&info).unwrap();

        connection.write_report(&[0x00]).unwrap();
        assert!(connection.is_plugged());
        connection.write_report(&[0x00]).unwrap();
        assert!(!connection.is_plugged());
        assert!(connection.write_report(&[0x00]).is_err());
    }
}
