//! Protocol error types

use thiserror::Error;

/// Report-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Report length does not match the fixed report size
    #[error("Malformed report: expected {expected} bytes, got {actual}")]
    MalformedReport { expected: usize, actual: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MalformedReport {
            expected: 9,
            actual: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Malformed report"));
        assert!(msg.contains("expected 9"));
        assert!(msg.contains("got 4"));
    }
}
