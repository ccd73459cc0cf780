//! Error taxonomy shared by cluster clients and reconcilers.

use thiserror::Error;

use crate::ObjectKey;

/// Failure of a single call against a cluster's object store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },
    /// Optimistic-concurrency mismatch: the write targeted a stale resourceVersion.
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict { kind: String, key: ObjectKey, message: String },
    /// API server unavailable, throttled, or the connection failed.
    #[error("transient: {0}")]
    Transient(String),
    /// The server refused the request (validation, RBAC, admission, malformed object).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Failure to turn a cluster name into a client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("cluster {0:?} is not registered")]
    UnknownCluster(String),
    #[error("cluster {0:?} is not ready")]
    NotReady(String),
    #[error("cluster {cluster:?} does not serve {kind}")]
    KindNotServed { cluster: String, kind: &'static str },
}

impl ResolveError {
    /// Cluster membership changes at runtime, so a missing cluster may appear later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ResolveError::KindNotServed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_wiring_errors_are_final() {
        assert!(ResolveError::UnknownCluster("target".into()).is_retryable());
        assert!(ResolveError::NotReady("target".into()).is_retryable());
        assert!(!ResolveError::KindNotServed { cluster: "source".into(), kind: "Target" }.is_retryable());
    }

    #[test]
    fn messages_name_the_object() {
        let e = StoreError::NotFound { kind: "Source".into(), key: ObjectKey::new("ns", "a") };
        assert_eq!(e.to_string(), "Source ns/a not found");
    }
}
