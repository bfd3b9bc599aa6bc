//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A log stream rejected a line
    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
