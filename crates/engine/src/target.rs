//! Target observer: logs Target activity in its own cluster, never writes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tandem_core::{ReconcileRequest, Target};
use tandem_kubehub::ClusterResolver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::{CallPolicy, Outcome, Reconcile, StoreOp, SyncError};

pub struct TargetObserver {
    resolver: Arc<dyn ClusterResolver>,
    calls: CallPolicy,
}

impl TargetObserver {
    pub fn new(resolver: Arc<dyn ClusterResolver>, calls: CallPolicy) -> Self {
        Self { resolver, calls }
    }

    /// Fetch the Target named by `req`. Every fetch failure, NotFound included, is returned.
    pub async fn observe(&self, cancel: &CancellationToken, req: &ReconcileRequest) -> Result<Target, SyncError> {
        let targets = self.resolver.resolve(&req.cluster)?.targets()?;
        let target = self.calls.call(cancel, StoreOp::GetTarget, &req.key, targets.get(&req.key)).await?;
        let status = target.status.clone().unwrap_or_default();
        info!(message = %status.message, additional_info = status.additional_info.len(), "reconciling Target");
        Ok(target)
    }
}

#[async_trait]
impl Reconcile for TargetObserver {
    fn name(&self) -> &'static str {
        "target"
    }

    async fn reconcile(&self, cancel: &CancellationToken, req: &ReconcileRequest) -> Outcome {
        let t0 = Instant::now();
        let span = info_span!(
            "reconcile",
            controller = "target",
            cluster = %req.cluster,
            namespace = %req.key.namespace,
            name = %req.key.name
        );
        let res = async {
            let res = self.observe(cancel, req).await;
            if let Err(e) = &res {
                error!(error = %e, "failed to get Target");
            }
            res
        }
        .instrument(span)
        .await;
        histogram!("tandem_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0, "controller" => "target");
        let outcome = Outcome::from_result(res, self.calls.retry_after);
        counter!("tandem_reconcile_total", 1u64, "controller" => "target", "outcome" => outcome.label());
        outcome
    }
}
