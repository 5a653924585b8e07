//! Error types for Lacuna.

use thiserror::Error;

/// Result type alias using LacunaError.
pub type Result<T> = std::result::Result<T, LacunaError>;

/// Errors that can occur in Lacuna operations.
#[derive(Debug, Error)]
pub enum LacunaError {
    // I/O errors (memfd creation, mapping syscalls)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Memory errors
    #[error("allocation of {bytes} bytes failed: {source}")]
    AllocationFailed {
        bytes: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("virtual reservation exhausted: requested {requested} extents, {available} available")]
    ReservationExhausted { requested: usize, available: usize },

    // Configuration errors
    #[error("invalid parameter: {name} = {value}")]
    InvalidParameter { name: &'static str, value: String },

    // Internal errors
    #[error("internal invariant violated: {0}")]
    Corrupted(String),
}

impl LacunaError {
    /// Builds an `InvalidParameter` error from any displayable value.
    pub fn invalid_parameter(name: &'static str, value: impl std::fmt::Display) -> Self {
        LacunaError::InvalidParameter {
            name,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::OutOfMemory, "mmap failed");
        let err: LacunaError = io_err.into();
        assert!(matches!(err, LacunaError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_allocation_failed_display() {
        let err = LacunaError::AllocationFailed {
            bytes: 65536,
            source: IoError::new(ErrorKind::OutOfMemory, "ENOMEM"),
        };
        assert_eq!(err.to_string(), "allocation of 65536 bytes failed: ENOMEM");
    }

    #[test]
    fn test_reservation_exhausted_display() {
        let err = LacunaError::ReservationExhausted {
            requested: 8,
            available: 2,
        };
        assert_eq!(
            err.to_string(),
            "virtual reservation exhausted: requested 8 extents, 2 available"
        );
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = LacunaError::invalid_parameter("segment_capacity", 7);
        assert_eq!(err.to_string(), "invalid parameter: segment_capacity = 7");
    }

    #[test]
    fn test_corrupted_display() {
        let err = LacunaError::Corrupted("separator out of order".to_string());
        assert_eq!(
            err.to_string(),
            "internal invariant violated: separator out of order"
        );
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        assert!(returns_ok().is_ok());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LacunaError>();
    }
}
