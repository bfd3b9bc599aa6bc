//! Device session
//!
//! A [`DeviceSession`] owns the open connection to exactly one meter. It
//! sends poll commands from the caller's thread and runs a dedicated
//! `hid-reader` thread that blocks on input reports and hands every one of
//! them to the registered [`ReportHandler`].
//!
//! ```text
//! CLOSED --open()--> OPEN --poll()--> POLLING
//!                      |                 |
//!                      +---- stop / unplug / write failure ----> STOPPED --close()--> CLOSED
//! ```

use protocol::{DeviceIdentity, POLL_COMMAND};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::error::{DeviceError, ReadError};
use super::transport::{HidConnection, HidDeviceInfo, HidTransport};

/// Callback invoked on the reader thread with each raw input report
///
/// Must return quickly; the next report is not read until it does.
pub type ReportHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Default timeout of a single blocking read on the reader thread
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Back-off after a failed read before trying again
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long queued reports keep being delivered once a stop is requested
pub const STOP_DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// Lifecycle of the device handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Polling,
    Stopped,
}

/// Open connection to one meter plus its reader thread
pub struct DeviceSession<C: HidConnection + 'static> {
    connection: Arc<C>,
    device: HidDeviceInfo,
    state: SessionState,
    reader_stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    polls_sent: u64,
}

impl<C: HidConnection + 'static> DeviceSession<C> {
    /// Open the first attached device matching `identity`
    ///
    /// Fails with [`DeviceError::NotFound`] when nothing matches. On success
    /// the reader thread is running and `handler` receives every report the
    /// device pushes.
    pub fn open<T>(
        transport: &T,
        identity: DeviceIdentity,
        read_timeout: Duration,
        handler: ReportHandler,
    ) -> Result<Self, DeviceError>
    where
        T: HidTransport<Connection = C>,
    {
        let candidates = transport.enumerate(identity)?;
        let device = candidates
            .into_iter()
            .next()
            .ok_or(DeviceError::NotFound {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            })?;

        info!("Opening {}", device);
        let connection = Arc::new(transport.open(&device)?);

        let reader_stop = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(
            Arc::clone(&connection),
            Arc::clone(&reader_stop),
            read_timeout,
            handler,
        );

        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(close_err) = connection.close() {
                    warn!("{}", close_err);
                }
                return Err(DeviceError::OpenFailed(format!(
                    "could not spawn reader thread: {}",
                    e
                )));
            }
        };

        Ok(Self {
            connection,
            device,
            state: SessionState::Open,
            reader_stop,
            reader: Some(reader),
            polls_sent: 0,
        })
    }

    /// Send the poll command asking the meter for one sample
    ///
    /// The sample itself arrives later through the report handler. Any write
    /// error moves the session to [`SessionState::Stopped`].
    pub fn poll(&mut self) -> Result<(), DeviceError> {
        match self.state {
            SessionState::Open | SessionState::Polling => {}
            SessionState::Stopped | SessionState::Closed => return Err(DeviceError::NotOpen),
        }

        match self.connection.write_report(&POLL_COMMAND) {
            Ok(_) => {
                self.polls_sent += 1;
                self.state = SessionState::Polling;
                debug!("Poll #{} sent", self.polls_sent);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Stopped;
                Err(e)
            }
        }
    }

    /// Live presence check
    pub fn is_plugged(&self) -> bool {
        match self.state {
            SessionState::Closed => false,
            _ => self.connection.is_plugged(),
        }
    }

    /// Stop polling; the handle stays open until [`DeviceSession::close`]
    pub fn stop(&mut self) {
        if matches!(self.state, SessionState::Open | SessionState::Polling) {
            self.state = SessionState::Stopped;
        }
    }

    /// Stop the reader thread and release the handle
    ///
    /// Returns within roughly [`STOP_DRAIN_WINDOW`] plus one read timeout,
    /// however fast the device keeps reporting. Idempotent. Close failures
    /// are logged and swallowed.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.stop();

        self.reader_stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            error!("HID reader thread panicked");
        }

        if let Err(e) = self.connection.close() {
            error!("{}", e);
        }

        self.state = SessionState::Closed;
        info!("Closed {}", self.device);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> &HidDeviceInfo {
        &self.device
    }

    /// Number of poll commands successfully sent
    pub fn polls_sent(&self) -> u64 {
        self.polls_sent
    }
}

impl<C: HidConnection + 'static> Drop for DeviceSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_reader<C: HidConnection + 'static>(
    connection: Arc<C>,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
    handler: ReportHandler,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("hid-reader".to_string())
        .spawn(move || reader_loop(connection, stop, read_timeout, handler))
}

/// Deliver reports until asked to stop or the device goes away
///
/// After a stop request, reports already queued by the device are still
/// delivered for at most [`STOP_DRAIN_WINDOW`]. A device that never stops
/// sending cannot keep the thread alive past that.
fn reader_loop<C: HidConnection>(
    connection: Arc<C>,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
    mut handler: ReportHandler,
) {
    debug!("HID reader thread started");
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if stop.load(Ordering::Acquire) {
            let deadline =
                *drain_deadline.get_or_insert_with(|| Instant::now() + STOP_DRAIN_WINDOW);
            if Instant::now() >= deadline {
                debug!("Stop requested, leaving remaining reports unread");
                break;
            }
        }

        match connection.read_report(read_timeout) {
            Ok(Some(report)) => {
                // Keep the thread alive if the handler panics
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(&report)
                }));
                if let Err(e) = result {
                    error!("Panic in report handler: {:?}", e);
                }
            }
            Ok(None) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(ReadError::Disconnected) => {
                warn!("Device disconnected, reader stopping");
                break;
            }
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                warn!("{}", e);
                std::thread::sleep(READ_RETRY_DELAY);
            }
        }
    }

    debug!("HID reader thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{DEFAULT_MOCK_REPORT, MockMeter, MockTransport};
    use std::sync::Mutex;

    fn collecting_handler() -> (ReportHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ReportHandler = Box::new(move |report: &[u8]| {
            sink.lock().unwrap().push(report.to_vec());
        });
        (handler, seen)
    }

    #[test]
    fn test_open_without_device_is_not_found() {
        let transport = MockTransport::empty();
        let (handler, _) = collecting_handler();

        let result = DeviceSession::open(
            &transport,
            DeviceIdentity::GM1356,
            DEFAULT_READ_TIMEOUT,
            handler,
        );

        assert!(matches!(result, Err(DeviceError::NotFound { .. })));
    }

    #[test]
    fn test_poll_moves_to_polling_and_delivers_report() {
        let meter = MockMeter::new();
        let transport = MockTransport::with_meter(meter.clone());
        let (handler, seen) = collecting_handler();

        let mut session = DeviceSession::open(
            &transport,
            DeviceIdentity::GM1356,
            DEFAULT_READ_TIMEOUT,
            handler,
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Open);

        session.poll().unwrap();
        assert_eq!(session.state(), SessionState::Polling);
        assert_eq!(session.polls_sent(), 1);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        assert_eq!(meter.writes(), vec![POLL_COMMAND.to_vec()]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(meter.close_count(), 1);
    }

    #[test]
    fn test_write_failure_stops_session() {
        let meter = MockMeter::new().fail_write_after(0, DeviceError::WriteTimeout);
        let transport = MockTransport::with_meter(meter.clone());
        let (handler, _) = collecting_handler();

        let mut session = DeviceSession::open(
            &transport,
            DeviceIdentity::GM1356,
            DEFAULT_READ_TIMEOUT,
            handler,
        )
        .unwrap();

        assert_eq!(session.poll(), Err(DeviceError::WriteTimeout));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.poll(), Err(DeviceError::NotOpen));
    }

    #[test]
    fn test_close_is_idempotent_and_runs_on_drop() {
        let meter = MockMeter::new();
        let transport = MockTransport::with_meter(meter.clone());
        let (handler, _) = collecting_handler();

        {
            let mut session = DeviceSession::open(
                &transport,
                DeviceIdentity::GM1356,
                DEFAULT_READ_TIMEOUT,
                handler,
            )
            .unwrap();
            session.close();
            session.close();
            assert!(!session.is_plugged());
        }

        assert_eq!(meter.close_count(), 1);
    }

    #[test]
    fn test_unplug_is_reported() {
        let meter = MockMeter::new();
        let transport = MockTransport::with_meter(meter.clone());
        let (handler, _) = collecting_handler();

        let session = DeviceSession::open(
            &transport,
            DeviceIdentity::GM1356,
            DEFAULT_READ_TIMEOUT,
            handler,
        )
        .unwrap();
        assert!(session.is_plugged());

        meter.unplug();
        assert!(!session.is_plugged());
    }

    #[test]
    fn test_close_returns_while_device_keeps_reporting() {
        let meter = MockMeter::new();
        let transport = MockTransport::with_meter(meter.clone());
        let (handler, seen) = collecting_handler();

        let mut session = DeviceSession::open(
            &transport,
            DeviceIdentity::GM1356,
            DEFAULT_READ_TIMEOUT,
            handler,
        )
        .unwrap();

        let streaming = Arc::new(AtomicBool::new(true));
        let feeder = {
            let meter = meter.clone();
            let streaming = Arc::clone(&streaming);
            std::thread::spawn(move || {
                while streaming.load(Ordering::Acquire) {
                    meter.push_report(DEFAULT_MOCK_REPORT.to_vec());
                    std::thread::sleep(Duration::from_millis(20));
                }
            })
        };
        std::thread::sleep(Duration::from_millis(100));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            session.close();
            let _ = done_tx.send(session.state());
        });

        let state = done_rx.recv_timeout(Duration::from_secs(3));
        streaming.store(false, Ordering::Release);
        feeder.join().unwrap();

        assert_eq!(state, Ok(SessionState::Closed));
        assert_eq!(meter.close_count(), 1);
        assert!(!seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_handler_does_not_kill_reader() {
        let meter = MockMeter::new();
        let transport = MockTransport::with_meter(meter.clone());
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let handler: ReportHandler = Box::new(move |_report: &[u8]| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                drop(n);
                panic!("first report");
            }
        });

        let mut session = DeviceSession::open(
            &transport,
            DeviceIdentity::GM1356,
            DEFAULT_READ_TIMEOUT,
            handler,
        )
        .unwrap();
        session.poll().unwrap();
        session.poll().unwrap();
        session.close();

        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
