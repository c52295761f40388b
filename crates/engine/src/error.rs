//! Error types for monitoring operations.

use std::time::Duration;
use thiserror::Error;

/// Low-level outcome of a failed status lookup.
///
/// Local to the status client: the retrying probe folds these into
/// `ServiceDown`/`Unknown` observations and never lets them escape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response: connect failure, timeout, or the service answered 5xx.
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    /// A response arrived but its body or status was not usable.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    #[inline]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Malformed(err.to_string())
    }
}

/// Persistence failure. Surfaced to callers of start/stop/add-token.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),
}

/// Alert delivery failure. Logged by the monitor, never fatal.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Alert delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Alert rejected by channel: {0}")]
    Rejected(String),
}

/// Errors surfaced by registry lifecycle operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for registry operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_kind() {
        assert!(TransportError::Unreachable("refused".into()).is_unreachable());
        assert!(!TransportError::Malformed("bad json".into()).is_unreachable());
    }

    #[test]
    fn test_serde_error_is_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let transport: TransportError = err.into();
        assert!(matches!(transport, TransportError::Malformed(_)));
    }

    #[test]
    fn test_store_error_converts_to_monitor_error() {
        let err: MonitorError = StoreError::Backend("disk full".into()).into();
        assert!(err.to_string().contains("disk full"));
    }
}
