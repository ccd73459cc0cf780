//! Tandem engine: the per-resource synchronization protocol.
//!
//! [`SourceSynchronizer`] projects a Source's spec onto the correlated Target and records each
//! step on the Source's condition ledger. [`TargetObserver`] only reads. Both are plain
//! request/response reconcilers: they never retry, sleep or queue; that is the dispatcher's job.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tandem_core::{ObjectKey, ReconcileRequest, ResolveError, StoreError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod source;
mod target;

pub use source::{SourceSynchronizer, SyncOptions, SyncReport};
pub use target::TargetObserver;

/// Which remote call a store error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    GetSource,
    UpdateSourceStatus,
    GetTarget,
    CreateTarget,
    UpdateTargetStatus,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::GetSource => "get Source",
            StoreOp::UpdateSourceStatus => "update Source status",
            StoreOp::GetTarget => "get Target",
            StoreOp::CreateTarget => "create Target",
            StoreOp::UpdateTargetStatus => "update Target status",
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to {op} {key}: {source}")]
    Store {
        op: StoreOp,
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl SyncError {
    /// Every store failure is retried, rejections included. Only a cluster wired to the wrong
    /// role is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Resolve(e) => e.is_retryable(),
            SyncError::Store { .. } | SyncError::Cancelled | SyncError::Timeout(_) => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Store { source, .. } if source.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Store { source, .. } if source.is_conflict())
    }
}

/// What the dispatch loop should do with a key after one reconciliation.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    /// Retryable failure; re-enqueue no sooner than the given delay.
    RetryAfter(Duration),
    /// Retrying cannot help; drop the key until a new event arrives.
    Fatal(SyncError),
}

impl Outcome {
    pub fn from_result<T>(res: Result<T, SyncError>, retry_after: Duration) -> Self {
        match res {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_retryable() => Outcome::RetryAfter(retry_after),
            Err(e) => Outcome::Fatal(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RetryAfter(_) => "retry",
            Outcome::Fatal(_) => "fatal",
        }
    }
}

/// Entry point the dispatch loop drives.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Controller name, used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn reconcile(&self, cancel: &CancellationToken, req: &ReconcileRequest) -> Outcome;
}

/// Per-call policy shared by both reconcilers.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Delay reported with `Outcome::RetryAfter`.
    pub retry_after: Duration,
    /// Deadline for each remote call; `None` waits as long as the store does.
    pub call_timeout: Option<Duration>,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self { retry_after: Duration::from_secs(1), call_timeout: None }
    }
}

impl CallPolicy {
    /// Run one remote call, giving up on cancellation or deadline.
    pub(crate) async fn call<T, F>(
        &self,
        cancel: &CancellationToken,
        op: StoreOp,
        key: &ObjectKey,
        fut: F,
    ) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let res = match self.call_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                r = tokio::time::timeout(limit, fut) => r.map_err(|_| SyncError::Timeout(limit))?,
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                r = fut => r,
            },
        };
        res.map_err(|source| SyncError::Store { op, key: key.clone(), source })
    }
}
