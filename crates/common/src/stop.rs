//! Cooperative stop signal
//!
//! The capture loop checks [`StopSignal::is_triggered`] once per iteration.
//! Any number of sources (Ctrl+C handler, duration timer, tests) can hold a
//! clone and trigger it. Triggering also wakes a pending
//! [`StopSignal::sleep`], so the loop does not wait out a full poll interval
//! before noticing.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a capture run ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop signal triggered (Ctrl+C, duration elapsed, sample limit)
    OperatorRequested,
    /// The meter disappeared from the bus
    DeviceUnplugged,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::OperatorRequested => f.write_str("Operator requested stop"),
            StopReason::DeviceUnplugged => f.write_str("Device unplugged"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    triggered: Mutex<bool>,
    wake: Condvar,
}

/// Shared, clonable stop flag
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake any sleeper
    pub fn trigger(&self) {
        let mut triggered = self
            .inner
            .triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *triggered = true;
        self.inner.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self
            .inner
            .triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep for `duration` or until triggered, whichever comes first
    ///
    /// Returns `true` if the signal was triggered.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut triggered = self
            .inner
            .triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _timeout) = self
                .inner
                .wake
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            triggered = guard;
        }

        *triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_shared_between_clones() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_triggered());

        clone.trigger();
        assert!(signal.is_triggered());
        assert!(clone.is_triggered());
    }

    #[test]
    fn test_sleep_runs_full_duration_when_not_triggered() {
        let signal = StopSignal::new();
        let start = Instant::now();
        assert!(!signal.sleep(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_trigger_wakes_sleeper() {
        let signal = StopSignal::new();
        let trigger = signal.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });

        let start = Instant::now();
        assert!(signal.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::DeviceUnplugged.to_string(), "Device unplugged");
        assert_eq!(
            StopReason::OperatorRequested.to_string(),
            "Operator requested stop"
        );
    }
}
