//! libusb-backed HID transport
//!
//! Talks to the meter through rusb instead of the kernel hidraw node: the HID
//! interface is claimed (detaching the kernel driver if bound), output
//! reports go out on the interrupt OUT endpoint (or a class `SET_REPORT`
//! control transfer when the device has none) and input reports are read
//! from the interrupt IN endpoint.
//!
//! The meter uses unnumbered reports. The leading report id byte is stripped
//! before sending and prepended again on receive, so callers always see the
//! 9-byte layout.

use protocol::{DeviceIdentity, REPORT_LEN};
use rusb::{
    Context, Device, DeviceDescriptor, DeviceHandle, Direction, Recipient, RequestType,
    TransferType, UsbContext,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::{DeviceError, ReadError, map_open_error, map_read_error, map_write_error};
use super::transport::{HidConnection, HidDeviceInfo, HidTransport};

/// USB interface class code for HID
const HID_CLASS: u8 = 0x03;
/// HID class request SET_REPORT
const HID_SET_REPORT: u8 = 0x09;
/// Report type "output" in the high byte of wValue
const HID_REPORT_TYPE_OUTPUT: u16 = 0x02;

/// Default timeout for output report writes
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport over a libusb context
pub struct RusbTransport {
    context: Context,
    write_timeout: Duration,
}

impl RusbTransport {
    pub fn new(write_timeout: Duration) -> Result<Self, DeviceError> {
        let context = Context::new().map_err(|e| DeviceError::Enumeration(e.to_string()))?;
        Ok(Self {
            context,
            write_timeout,
        })
    }

    /// Find the live rusb device behind an enumeration record
    fn find_device(&self, info: &HidDeviceInfo) -> Result<Option<Device<Context>>, DeviceError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| DeviceError::Enumeration(e.to_string()))?;

        Ok(devices
            .iter()
            .find(|device| same_device(device, info)))
    }
}

impl HidTransport for RusbTransport {
    type Connection = RusbConnection;

    fn enumerate(&self, identity: DeviceIdentity) -> Result<Vec<HidDeviceInfo>, DeviceError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| DeviceError::Enumeration(e.to_string()))?;

        let mut found = Vec::new();
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "Skipping device bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if !identity.matches(descriptor.vendor_id(), descriptor.product_id()) {
                continue;
            }

            found.push(describe(&device, &descriptor));
        }

        debug!("Enumerated {} device(s) matching {}", found.len(), identity);
        Ok(found)
    }

    fn open(&self, info: &HidDeviceInfo) -> Result<RusbConnection, DeviceError> {
        let device = self.find_device(info)?.ok_or(DeviceError::NotFound {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
        })?;

        RusbConnection::open(device, info.clone(), self.write_timeout)
    }
}

/// Open handle with the HID interface claimed
pub struct RusbConnection {
    handle: DeviceHandle<Context>,
    info: HidDeviceInfo,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: Option<u8>,
    in_packet_size: usize,
    kernel_driver_detached: bool,
    write_timeout: Duration,
    unplugged: AtomicBool,
    closed: AtomicBool,
}

/// Endpoints of the HID interface
struct HidEndpoints {
    interface: u8,
    endpoint_in: u8,
    in_packet_size: usize,
    endpoint_out: Option<u8>,
}

impl RusbConnection {
    fn open(
        device: Device<Context>,
        info: HidDeviceInfo,
        write_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let endpoints = find_hid_endpoints(&device)?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_open_error(e)
        })?;

        debug!(
            "Opened {} (interface {}, IN {:#04x}, OUT {:?})",
            info, endpoints.interface, endpoints.endpoint_in, endpoints.endpoint_out
        );

        let interface = endpoints.interface;
        let mut kernel_driver_detached = false;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => kernel_driver_detached = true,
                    // Claiming will most likely fail next and report the real error
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            // handle is dropped here, closing the libusb handle
            return Err(map_open_error(e));
        }

        debug!("Claimed interface {}", interface);

        Ok(Self {
            handle,
            info,
            interface,
            endpoint_in: endpoints.endpoint_in,
            endpoint_out: endpoints.endpoint_out,
            in_packet_size: endpoints.in_packet_size,
            kernel_driver_detached,
            write_timeout,
            unplugged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn mark_unplugged(&self) {
        if !self.unplugged.swap(true, Ordering::AcqRel) {
            debug!("Device {} reported as disconnected", self.info);
        }
    }
}

impl HidConnection for RusbConnection {
    fn write_report(&self, report: &[u8]) -> Result<usize, DeviceError> {
        let (report_id, payload) = split_report_id(report);

        let result = match self.endpoint_out {
            Some(endpoint) => self
                .handle
                .write_interrupt(endpoint, payload, self.write_timeout),
            None => self.handle.write_control(
                rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface),
                HID_SET_REPORT,
                (HID_REPORT_TYPE_OUTPUT << 8) | u16::from(report_id),
                u16::from(self.interface),
                payload,
                self.write_timeout,
            ),
        };

        match result {
            Ok(written) if written == payload.len() => Ok(report.len()),
            Ok(written) => Err(DeviceError::WriteFailed(format!(
                "short write: {} of {} bytes",
                written,
                payload.len()
            ))),
            Err(e) => {
                if e == rusb::Error::NoDevice {
                    self.mark_unplugged();
                }
                Err(map_write_error(e))
            }
        }
    }

    fn read_report(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ReadError> {
        let mut buf = vec![0u8; self.in_packet_size.max(REPORT_LEN - 1)];

        match self.handle.read_interrupt(self.endpoint_in, &mut buf, timeout) {
            Ok(len) => {
                let mut report = Vec::with_capacity(len + 1);
                report.push(0x00);
                report.extend_from_slice(&buf[..len]);
                Ok(Some(report))
            }
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => {
                if e == rusb::Error::NoDevice {
                    self.mark_unplugged();
                }
                Err(map_read_error(e))
            }
        }
    }

    fn is_plugged(&self) -> bool {
        if self.unplugged.load(Ordering::Acquire) {
            return false;
        }

        let devices = match self.handle.context().devices() {
            Ok(devices) => devices,
            Err(e) => {
                // Can't tell; a dead device will surface as a write error
                debug!("Could not list devices for presence check: {}", e);
                return true;
            }
        };

        let present = devices.iter().any(|device| same_device(&device, &self.info));
        if !present {
            self.mark_unplugged();
        }
        present
    }

    fn close(&self) -> Result<(), DeviceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.unplugged.load(Ordering::Acquire) {
            debug!("Device already gone, nothing to release");
            return Ok(());
        }

        let released = self.handle.release_interface(self.interface);

        if self.kernel_driver_detached {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", self.interface);
            }
        }

        released.map_err(|e| DeviceError::CloseFailed(e.to_string()))?;
        debug!("Closed {}", self.info);
        Ok(())
    }
}

/// Split the report id off an output report
///
/// Report id 0 means "unnumbered" and is not sent on the wire.
fn split_report_id(report: &[u8]) -> (u8, &[u8]) {
    match report.split_first() {
        Some((0, rest)) => (0, rest),
        Some((id, _)) => (*id, report),
        None => (0, report),
    }
}

fn same_device<T: UsbContext>(device: &Device<T>, info: &HidDeviceInfo) -> bool {
    device.bus_number() == info.bus_number
        && device.address() == info.address
        && device
            .device_descriptor()
            .map(|d| d.vendor_id() == info.vendor_id && d.product_id() == info.product_id)
            .unwrap_or(false)
}

/// Locate the first HID interface with an interrupt IN endpoint
fn find_hid_endpoints(device: &Device<Context>) -> Result<HidEndpoints, DeviceError> {
    let config = device.active_config_descriptor().map_err(|e| {
        warn!("Failed to get active config descriptor: {}", e);
        DeviceError::OpenFailed(format!("Failed to get config descriptor: {}", e))
    })?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != HID_CLASS {
                continue;
            }

            let mut endpoint_in = None;
            let mut endpoint_out = None;

            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => {
                        endpoint_in.get_or_insert((
                            endpoint.address(),
                            usize::from(endpoint.max_packet_size()),
                        ));
                    }
                    Direction::Out => {
                        endpoint_out.get_or_insert(endpoint.address());
                    }
                }
            }

            if let Some((address, packet_size)) = endpoint_in {
                return Ok(HidEndpoints {
                    interface: descriptor.interface_number(),
                    endpoint_in: address,
                    in_packet_size: packet_size,
                    endpoint_out,
                });
            }
        }
    }

    Err(DeviceError::OpenFailed(
        "no HID interface with an interrupt IN endpoint".to_string(),
    ))
}

/// Build an enumeration record, reading string descriptors when possible
fn describe(device: &Device<Context>, descriptor: &DeviceDescriptor) -> HidDeviceInfo {
    let (manufacturer, product, serial_number) = device
        .open()
        .ok()
        .map(|handle| read_string_descriptors(&handle, descriptor))
        .unwrap_or((None, None, None));

    HidDeviceInfo {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bus_number: device.bus_number(),
        address: device.address(),
        manufacturer,
        product,
        serial_number,
    }
}

fn read_string_descriptors(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let manufacturer = descriptor
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    let product = descriptor
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    let serial_number = descriptor
        .serial_number_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    (manufacturer, product, serial_number)
}
