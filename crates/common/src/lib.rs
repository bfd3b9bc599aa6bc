//! Common utilities for gm1356-logger
//!
//! This crate provides the ambient pieces shared by the capture binary and
//! its tests: the error type, tracing setup, and the cooperative stop signal
//! checked by the capture loop.

pub mod error;
pub mod logging;
pub mod stop;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use stop::{StopReason, StopSignal};
