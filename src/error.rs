//! Unified error handling for the control plane
//!
//! Subsystems return their own typed errors (`RoutingError`,
//! `CollectorError`, `StoreError`, …); this module wraps them into a single
//! [`Error`] for callers that cross subsystem boundaries, with a category for
//! metrics/logging and a recoverability predicate the retry machinery keys on.

use thiserror::Error;

pub use crate::collector::CollectorError;
pub use crate::dispatcher::{DispatchError, GatewayError};
pub use crate::routing::{ProcessError, RoutingError};
pub use crate::store::StoreError;

/// Unified result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error category for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Routing reconciler and ring errors
    Routing,
    /// Collector cache errors
    Collector,
    /// Store I/O and versioning errors
    Store,
    /// Dispatcher and cluster-gateway errors
    Dispatch,
    /// Configuration errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Routing => "routing",
            ErrorCategory::Collector => "collector",
            ErrorCategory::Store => "store",
            ErrorCategory::Dispatch => "dispatch",
            ErrorCategory::Config => "config",
            ErrorCategory::Other => "other",
        }
    }
}

/// Unified error type for cross-subsystem operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("cluster gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether a retry can be expected to succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Routing(err) => err.is_retryable(),
            // Cache-state violations need a corrected event, not a retry; the
            // snapshot inconsistency is the exception, where the caller
            // retries its cycle against the rebuilt list.
            Error::Collector(err) => {
                matches!(err, CollectorError::InconsistentSnapshot { .. })
            }
            Error::Store(err) => err.is_retryable(),
            Error::Dispatch(DispatchError::Store(err)) => err.is_retryable(),
            Error::Dispatch(DispatchError::Gateway(_)) => true,
            Error::Gateway(_) => true,
            Error::Config(_) => false,
            Error::Other(_) => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Routing(_) => ErrorCategory::Routing,
            Error::Collector(_) => ErrorCategory::Collector,
            Error::Store(_) => ErrorCategory::Store,
            Error::Dispatch(_) | Error::Gateway(_) => ErrorCategory::Dispatch,
            Error::Config(_) => ErrorCategory::Config,
            Error::Other(_) => ErrorCategory::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceKey;

    #[test]
    fn test_store_error_classification() {
        let err: Error = StoreError::Transient("connection reset".to_string()).into();
        assert!(err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Store);

        let err: Error = StoreError::NotFound {
            key: ResourceKey::system("sched-a"),
        }
        .into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_routing_error_classification() {
        let err: Error = RoutingError::RingEmpty.into();
        assert!(err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Routing);
    }

    #[test]
    fn test_collector_error_classification() {
        let violation: Error = CollectorError::AlreadyAdded {
            key: "w1".to_string(),
        }
        .into();
        assert!(!violation.is_recoverable());

        let inconsistent: Error = CollectorError::InconsistentSnapshot {
            list_len: 2,
            tree_len: 3,
            map_len: 3,
            cache_len: 3,
        }
        .into();
        assert!(inconsistent.is_recoverable());
        assert_eq!(inconsistent.category(), ErrorCategory::Collector);
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("bad worker count");
        assert!(!err.is_recoverable());
        assert_eq!(err.category().as_str(), "config");
    }
}
