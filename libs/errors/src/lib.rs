//! Unified error taxonomy for gateway services
//!
//! Each service keeps its own domain error enum and exposes a common
//! outward-facing interface by implementing [`GatewayErrorTrait`]: a stable
//! code, a category, retry hints and the HTTP status an API layer would use.

// ============================================================================
// Error categories
// ============================================================================

/// Coarse classification used for retry decisions, status mapping and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    // Caller side
    Configuration,
    Validation,
    NotFound,
    Conflict,
    Permission,

    // Field devices
    Connection,
    Network,
    Timeout,
    Protocol,
    Unavailable,

    // Storage
    Database,
    Cache,

    // System level
    ResourceBusy,
    Internal,
}

/// Gateway error capability trait
///
/// # Design principles
///
/// 1. Domain preservation: keep service-specific error variants
/// 2. Unified interface: present a common outward-facing interface via the trait
/// 3. Sensible defaults: services override only what differs
pub trait GatewayErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for API, logs, monitoring)
    fn error_code(&self) -> &'static str;

    /// Get error category (for classification/metrics)
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::ResourceBusy
        )
    }

    /// Recommended retry delay in milliseconds
    fn retry_delay_ms(&self) -> u64 {
        match self.category() {
            ErrorCategory::Network => 1000,
            ErrorCategory::Timeout => 500,
            ErrorCategory::ResourceBusy => 2000,
            ErrorCategory::Connection => 1500,
            ErrorCategory::Unavailable => 5000,
            _ => 0,
        }
    }

    /// HTTP status code the API layer should answer with
    fn status_code(&self) -> u16 {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Validation => 400,
            ErrorCategory::Permission => 403,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Conflict => 409,
            ErrorCategory::Protocol | ErrorCategory::Connection | ErrorCategory::Network => 502,
            ErrorCategory::Unavailable | ErrorCategory::ResourceBusy => 503,
            ErrorCategory::Timeout => 504,
            ErrorCategory::Database | ErrorCategory::Cache | ErrorCategory::Internal => 500,
        }
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Database => Level::ERROR,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol
            | ErrorCategory::Unavailable
            | ErrorCategory::Cache => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum SampleError {
        #[error("device timed out")]
        Timeout,
        #[error("tag missing")]
        Missing,
        #[error("bad input")]
        Invalid,
    }

    impl GatewayErrorTrait for SampleError {
        fn error_code(&self) -> &'static str {
            match self {
                Self::Timeout => "SAMPLE_TIMEOUT",
                Self::Missing => "SAMPLE_NOT_FOUND",
                Self::Invalid => "SAMPLE_INVALID",
            }
        }

        fn category(&self) -> ErrorCategory {
            match self {
                Self::Timeout => ErrorCategory::Timeout,
                Self::Missing => ErrorCategory::NotFound,
                Self::Invalid => ErrorCategory::Validation,
            }
        }
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(SampleError::Timeout.status_code(), 504);
        assert_eq!(SampleError::Missing.status_code(), 404);
        assert_eq!(SampleError::Invalid.status_code(), 400);
    }

    #[test]
    fn test_error_retryable() {
        assert!(SampleError::Timeout.is_retryable());
        assert!(!SampleError::Missing.is_retryable());
        assert!(!SampleError::Invalid.is_retryable());
        assert_eq!(SampleError::Invalid.retry_delay_ms(), 0);
    }
}
