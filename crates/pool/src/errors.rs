//! Connection pool error types.

use thiserror::Error;

/// Connection pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    #[error("Connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("No healthy connection available for {target}")]
    NoHealthyConnection { target: String },

    #[error("Connection selection cancelled")]
    Cancelled,

    #[error("Connection to {target} is closed")]
    ConnectionClosed { target: String },

    #[error("Pool for {target} is closed")]
    PoolClosed { target: String },

    #[error("Failed to close {} connection(s) for {scope}: {}", failures.len(), failures.join("; "))]
    CloseFailed { scope: String, failures: Vec<String> },

    #[error("Service {service}: {source}")]
    Service {
        service: String,
        #[source]
        source: Box<PoolError>,
    },
}

impl PoolError {
    pub(crate) fn connection_failed(target: impl Into<String>, reason: impl ToString) -> Self {
        PoolError::ConnectionFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Tag an error with the logical service it belongs to.
    pub fn for_service(self, service: impl Into<String>) -> Self {
        PoolError::Service {
            service: service.into(),
            source: Box::new(self),
        }
    }

    /// Whether the caller may reasonably retry the operation later.
    ///
    /// Exhaustion, dial failures and cancellation are operational; a closed
    /// pool or an invalid target will not get better by waiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::ConnectionFailed { .. }
            | PoolError::NoHealthyConnection { .. }
            | PoolError::Cancelled => true,
            PoolError::Service { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_failed_message() {
        let err = PoolError::CloseFailed {
            scope: "orders:9000".to_string(),
            failures: vec!["slot 0: reset".to_string(), "slot 3: timeout".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Failed to close 2 connection(s) for orders:9000: slot 0: reset; slot 3: timeout"
        );
    }

    #[test]
    fn test_service_tagging_keeps_source() {
        let err = PoolError::connection_failed("payments:7000", "refused").for_service("payment-service");
        assert!(err.to_string().starts_with("Service payment-service:"));
        assert!(err.is_retryable());

        match err {
            PoolError::Service { service, source } => {
                assert_eq!(service, "payment-service");
                assert!(matches!(*source, PoolError::ConnectionFailed { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PoolError::NoHealthyConnection { target: "a".into() }.is_retryable());
        assert!(PoolError::Cancelled.is_retryable());
        assert!(!PoolError::PoolClosed { target: "a".into() }.is_retryable());
        assert!(!PoolError::InvalidTarget(String::new()).is_retryable());
    }
}
