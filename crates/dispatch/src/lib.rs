//! Tandem dispatch: turns change notifications into reconcile invocations.
//!
//! Requests flow from watchers through an mpsc channel into a [`WorkQueue`], which coalesces
//! duplicates and never hands the same key to two workers at once. A [`Controller`] pulls from
//! the queue with bounded concurrency and applies per-key exponential backoff to retryable
//! outcomes.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tandem_core::ReconcileRequest;
use tandem_engine::{Outcome, Reconcile};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod backoff;
mod queue;

pub use backoff::Backoff;
pub use queue::WorkQueue;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound on reconciliations in flight for one controller.
    pub concurrency: usize,
    /// Cap on per-key retry delay.
    pub max_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { concurrency: 4, max_backoff: Duration::from_secs(300) }
    }
}

/// Drives one reconciler from its own work queue.
pub struct Controller {
    reconciler: Arc<dyn Reconcile>,
    queue: WorkQueue,
    backoff: Backoff,
    cfg: DispatchConfig,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconcile>, cfg: DispatchConfig) -> Self {
        Self { reconciler, queue: WorkQueue::new(), backoff: Backoff::new(cfg.max_backoff), cfg }
    }

    /// Handle for feeding requests into this controller.
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Forward requests from a watcher channel into the queue until the channel closes.
    pub fn spawn_feed(&self, mut rx: mpsc::Receiver<ReconcileRequest>) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let name = self.reconciler.name();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                queue.add(req);
            }
            debug!(controller = name, "request channel closed; feed stopped");
        })
    }

    /// Run until `cancel` fires, then wait for in-flight reconciliations to finish.
    pub async fn run(self, cancel: CancellationToken) {
        let name = self.reconciler.name();
        let permits = self.cfg.concurrency.max(1);
        let sem = Arc::new(Semaphore::new(permits));
        let backoff = Arc::new(self.backoff);
        info!(controller = name, concurrency = permits, "controller started");
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                p = Arc::clone(&sem).acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let req = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.queue.get() => match r {
                    Some(r) => r,
                    None => break,
                },
            };
            metrics::gauge!("tandem_queue_depth", self.queue.len() as f64, "controller" => name);

            let reconciler = Arc::clone(&self.reconciler);
            let queue = self.queue.clone();
            let backoff = Arc::clone(&backoff);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let outcome = reconciler.reconcile(&cancel, &req).await;
                match outcome {
                    Outcome::Success => backoff.forget(&req),
                    Outcome::RetryAfter(floor) => {
                        let delay = backoff.next_delay(&req, floor);
                        debug!(controller = name, request = %req, delay_ms = %delay.as_millis(), "requeue with backoff");
                        queue.add_after(req.clone(), delay);
                    }
                    Outcome::Fatal(e) => {
                        error!(controller = name, request = %req, error = %e, "dropping request after fatal error");
                        backoff.forget(&req);
                    }
                }
                queue.done(&req);
                drop(permit);
            });
        }
        self.queue.shutdown();
        match sem.acquire_many(permits as u32).await {
            Ok(_) => info!(controller = name, "controller stopped"),
            Err(e) => warn!(controller = name, error = %e, "controller stopped without draining"),
        };
    }
}
