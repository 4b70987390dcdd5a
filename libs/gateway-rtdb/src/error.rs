//! Error types for gateway-rtdb

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtdbError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid value for key {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RtdbError::Unavailable("injected".to_string());
        assert_eq!(err.to_string(), "Backend unavailable: injected");

        let err = RtdbError::InvalidValue {
            key: "plc:1:tag:2".to_string(),
            reason: "not utf-8".to_string(),
        };
        assert!(err.to_string().contains("plc:1:tag:2"));
    }
}
