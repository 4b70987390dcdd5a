//! Error handling for the PLC gateway service

use crate::protocol::codec::CodecError;
use crate::store::{StoreError, StoreErrorKind};
use errors::{ErrorCategory, GatewayErrorTrait};
use thiserror::Error;

/// Upper bound on causes carried by an aggregate failure
pub const MAX_ERROR_SAMPLES: usize = 5;

/// PLC gateway error type
#[derive(Error, Debug)]
pub enum PlcError {
    /// Rejected input, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tag '{0}' is not writable")]
    WriteNotPermitted(String),

    /// Encode/decode failure, indicates a data-type mismatch
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Device answered but rejected or garbled the request
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(
        "circuit breaker is open for device {device_id} (attempts: {attempts}, last error: {})",
        .last_error.as_deref().unwrap_or("none")
    )]
    CircuitOpen {
        device_id: i64,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<PlcError>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("{failed} of {total} items failed: {}", .samples.join("; "))]
    PartialFailure {
        failed: usize,
        total: usize,
        samples: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the PLC gateway service
pub type Result<T> = std::result::Result<T, PlcError>;

impl PlcError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn cache(err: impl std::fmt::Display) -> Self {
        Self::Cache(err.to_string())
    }

    /// Build an aggregate error keeping a bounded sample of causes
    pub fn partial(total: usize, errors: &[String]) -> Self {
        Self::PartialFailure {
            failed: errors.len(),
            total,
            samples: errors.iter().take(MAX_ERROR_SAMPLES).cloned().collect(),
        }
    }

    /// Network-level failure worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Cancelled
        )
    }

    /// Device cannot currently be reached, whatever the wrapping
    pub fn is_device_unavailable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => true,
            Self::RetriesExhausted { source, .. } => source.is_device_unavailable(),
            other => other.is_transient(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Store(e) => e.kind == StoreErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<std::io::Error> for PlcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                PlcError::Timeout(err.to_string())
            },
            _ => PlcError::Connection(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for PlcError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        PlcError::Timeout(err.to_string())
    }
}

impl From<figment::Error> for PlcError {
    fn from(err: figment::Error) -> Self {
        PlcError::Config(err.to_string())
    }
}

// ============================================================================
// PlcError implements GatewayErrorTrait
// ============================================================================

impl GatewayErrorTrait for PlcError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "PLCSRV_VALIDATION_ERROR",
            Self::NotFound(_) => "PLCSRV_NOT_FOUND",
            Self::WriteNotPermitted(_) => "PLCSRV_WRITE_NOT_PERMITTED",
            Self::Codec(_) => "PLCSRV_CODEC_ERROR",
            Self::Protocol(_) => "PLCSRV_PROTOCOL_ERROR",
            Self::Connection(_) => "PLCSRV_CONNECTION_ERROR",
            Self::Timeout(_) => "PLCSRV_TIMEOUT",
            Self::Cancelled => "PLCSRV_CANCELLED",
            Self::CircuitOpen { .. } => "PLCSRV_CIRCUIT_OPEN",
            Self::RetriesExhausted { .. } => "PLCSRV_RETRIES_EXHAUSTED",
            Self::Store(e) => match e.kind {
                StoreErrorKind::NotFound => "PLCSRV_NOT_FOUND",
                StoreErrorKind::Invalid => "PLCSRV_STORE_INVALID",
                StoreErrorKind::Transient => "PLCSRV_STORE_ERROR",
            },
            Self::Cache(_) => "PLCSRV_CACHE_ERROR",
            Self::PartialFailure { .. } => "PLCSRV_PARTIAL_FAILURE",
            Self::Config(_) => "PLCSRV_CONFIG_ERROR",
            Self::Internal(_) => "PLCSRV_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Codec(_) => ErrorCategory::Validation,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::WriteNotPermitted(_) => ErrorCategory::Permission,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Connection(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::ResourceBusy,
            Self::CircuitOpen { .. } => ErrorCategory::Unavailable,
            Self::RetriesExhausted { source, .. } => source.category(),
            Self::Store(e) => match e.kind {
                StoreErrorKind::NotFound => ErrorCategory::NotFound,
                StoreErrorKind::Invalid => ErrorCategory::Conflict,
                StoreErrorKind::Transient => ErrorCategory::Database,
            },
            Self::Cache(_) => ErrorCategory::Cache,
            Self::PartialFailure { .. } => ErrorCategory::Internal,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            // Caller already got the full retry budget
            Self::RetriesExhausted { .. } => false,
            _ => self.is_transient(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PlcError::connection("reset").is_transient());
        assert!(PlcError::Timeout("read".into()).is_transient());
        assert!(PlcError::Cancelled.is_transient());
        assert!(!PlcError::Validation("x".into()).is_transient());
        assert!(!PlcError::Codec(CodecError::UnsupportedType("lreal".into())).is_transient());
        assert!(!PlcError::protocol("object missing").is_transient());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: PlcError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, PlcError::Timeout(_)));

        let err: PlcError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, PlcError::Connection(_)));
    }

    #[test]
    fn test_circuit_open_message() {
        let err = PlcError::CircuitOpen {
            device_id: 3,
            attempts: 0,
            last_error: Some("Connection error: refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("circuit breaker is open"));
        assert!(msg.contains("refused"));
        assert!(err.is_device_unavailable());
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn test_retries_exhausted_wraps_cause() {
        let err = PlcError::RetriesExhausted {
            attempts: 3,
            source: Box::new(PlcError::Timeout("read".into())),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.is_device_unavailable());
        assert!(!err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn test_partial_failure_samples_bounded() {
        let causes: Vec<String> = (0..12).map(|i| format!("tag {} failed", i)).collect();
        let err = PlcError::partial(40, &causes);
        match &err {
            PlcError::PartialFailure {
                failed,
                total,
                samples,
            } => {
                assert_eq!(*failed, 12);
                assert_eq!(*total, 40);
                assert_eq!(samples.len(), MAX_ERROR_SAMPLES);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.to_string().starts_with("12 of 40 items failed"));
    }

    #[test]
    fn test_store_not_found_maps_to_404() {
        let err = PlcError::from(StoreError::not_found("device 9"));
        assert!(err.is_not_found());
        assert_eq!(err.status_code(), 404);
    }
}
