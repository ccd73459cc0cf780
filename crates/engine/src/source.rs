//! Source synchronizer: project Source.spec onto the correlated Target's status.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tandem_core::{conditions::Entry, ConditionType, ObjectKey, ReconcileRequest, Source, Target, TARGET_CLUSTER};
use tandem_kubehub::{ClusterResolver, ObjectStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{CallPolicy, Outcome, Reconcile, StoreOp, SyncError};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Cluster holding the Targets.
    pub target_cluster: String,
    /// Append a `SyncFailed` condition before returning a Target create/update error.
    pub record_failures: bool,
    pub calls: CallPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { target_cluster: TARGET_CLUSTER.to_string(), record_failures: false, calls: CallPolicy::default() }
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReport {
    /// The Source is gone (or not visible yet); nothing was written.
    SourceMissing,
    CreatedTarget,
    UpdatedTarget,
}

pub struct SourceSynchronizer {
    resolver: Arc<dyn ClusterResolver>,
    opts: SyncOptions,
}

impl SourceSynchronizer {
    pub fn new(resolver: Arc<dyn ClusterResolver>, opts: SyncOptions) -> Self {
        Self { resolver, opts }
    }

    /// One full synchronization pass for the Source named by `req`.
    ///
    /// Every call is issued in order and the first error aborts the pass; steps already
    /// written (e.g. the `Reconciling` heartbeat) stay written.
    pub async fn sync(&self, cancel: &CancellationToken, req: &ReconcileRequest) -> Result<SyncReport, SyncError> {
        let calls = &self.opts.calls;
        let key = &req.key;
        let sources = self.resolver.resolve(&req.cluster)?.sources()?;

        let source = match calls.call(cancel, StoreOp::GetSource, key, sources.get(key)).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                debug!("Source not found; nothing to do");
                return Ok(SyncReport::SourceMissing);
            }
            Err(e) => return Err(e),
        };

        let source = self.record(cancel, sources.as_ref(), key, source, ConditionType::Reconciling.entry()).await?;
        info!(message = %source.spec.message, additional_info = ?source.spec.additional_info, "reconciling Source");

        let targets = self.resolver.resolve(&self.opts.target_cluster)?.targets()?;
        let projected = source.projected_status();

        match calls.call(cancel, StoreOp::GetTarget, key, targets.get(key)).await {
            Err(e) if e.is_not_found() => {
                let target = Target::projected(key, projected);
                if let Err(e) = calls.call(cancel, StoreOp::CreateTarget, key, targets.create(&target)).await {
                    return Err(self.fail(cancel, sources.as_ref(), key, source, "TargetCreateFailed", e).await);
                }
                info!(cluster = %self.opts.target_cluster, "created Target");
                self.record(cancel, sources.as_ref(), key, source, ConditionType::CreatedTarget.entry()).await?;
                Ok(SyncReport::CreatedTarget)
            }
            Err(e) => Err(e),
            Ok(mut target) => {
                target.apply_projection(projected);
                if let Err(e) = calls.call(cancel, StoreOp::UpdateTargetStatus, key, targets.update_status(&target)).await {
                    return Err(self.fail(cancel, sources.as_ref(), key, source, "TargetUpdateFailed", e).await);
                }
                debug!(cluster = %self.opts.target_cluster, "updated Target status");
                self.record(cancel, sources.as_ref(), key, source, ConditionType::UpdatedTarget.entry()).await?;
                Ok(SyncReport::UpdatedTarget)
            }
        }
    }

    /// Append `entry` to the Source ledger and persist it; returns the written Source.
    async fn record(
        &self,
        cancel: &CancellationToken,
        sources: &dyn ObjectStore<Source>,
        key: &ObjectKey,
        mut source: Source,
        entry: Entry<'_>,
    ) -> Result<Source, SyncError> {
        let type_label = entry.type_.to_string();
        let generation = source.metadata.generation;
        let status = source.status.take().unwrap_or_default();
        source.status = Some(status.record(entry.with_generation(generation), chrono::Utc::now()));
        let written = self
            .opts
            .calls
            .call(cancel, StoreOp::UpdateSourceStatus, key, sources.update_status(&source))
            .await?;
        counter!("tandem_conditions_appended_total", 1u64, "type" => type_label);
        Ok(written)
    }

    /// Optionally leave a `SyncFailed` entry behind, then hand back the original error.
    async fn fail(
        &self,
        cancel: &CancellationToken,
        sources: &dyn ObjectStore<Source>,
        key: &ObjectKey,
        source: Source,
        reason: &'static str,
        err: SyncError,
    ) -> SyncError {
        if self.opts.record_failures && !matches!(err, SyncError::Cancelled) {
            let entry = ConditionType::SyncFailed.entry().with_reason(reason).with_message(err.to_string());
            if let Err(e) = self.record(cancel, sources, key, source, entry).await {
                warn!(error = %e, "failed to record SyncFailed condition");
            }
        }
        err
    }
}

#[async_trait]
impl Reconcile for SourceSynchronizer {
    fn name(&self) -> &'static str {
        "source"
    }

    async fn reconcile(&self, cancel: &CancellationToken, req: &ReconcileRequest) -> Outcome {
        let t0 = Instant::now();
        let span = info_span!(
            "reconcile",
            controller = "source",
            cluster = %req.cluster,
            namespace = %req.key.namespace,
            name = %req.key.name
        );
        let res = async {
            let res = self.sync(cancel, req).await;
            match &res {
                Ok(report) => debug!(?report, took_ms = %t0.elapsed().as_millis(), "reconciled"),
                Err(e) => error!(error = %e, retryable = e.is_retryable(), "reconcile failed"),
            }
            res
        }
        .instrument(span)
        .await;
        histogram!("tandem_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0, "controller" => "source");
        let outcome = Outcome::from_result(res, self.opts.calls.retry_after);
        counter!("tandem_reconcile_total", 1u64, "controller" => "source", "outcome" => outcome.label());
        outcome
    }
}
