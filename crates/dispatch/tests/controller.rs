use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tandem_core::{ObjectKey, ReconcileRequest, Source, SourceSpec, Target};
use tandem_dispatch::{Controller, DispatchConfig};
use tandem_engine::{Outcome, Reconcile, SourceSynchronizer, SyncOptions};
use tandem_kubehub::{ClusterClient, ClusterSet};
use tandem_store::MemoryStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn req(name: &str) -> ReconcileRequest {
    ReconcileRequest::new("source", ObjectKey::new("ns", name))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Fails the first `fail_first` calls per run, records every call.
struct Flaky {
    fail_first: usize,
    calls: AtomicUsize,
    seen: Mutex<Vec<ReconcileRequest>>,
}

#[async_trait]
impl Reconcile for Flaky {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn reconcile(&self, _cancel: &CancellationToken, req: &ReconcileRequest) -> Outcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req.clone());
        if n < self.fail_first {
            Outcome::RetryAfter(Duration::from_millis(5))
        } else {
            Outcome::Success
        }
    }
}

#[tokio::test]
async fn retryable_outcomes_are_requeued() {
    let flaky = Arc::new(Flaky { fail_first: 2, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) });
    let ctl = Controller::new(flaky.clone(), DispatchConfig { concurrency: 1, max_backoff: Duration::from_millis(50) });
    let queue = ctl.queue();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(ctl.run(cancel.clone()));

    queue.add(req("a"));
    eventually(|| flaky.calls.load(Ordering::SeqCst) >= 3).await;
    cancel.cancel();
    run.await.unwrap();

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert!(flaky.seen.lock().unwrap().iter().all(|r| *r == req("a")));
}

/// Tracks the peak number of overlapping reconciliations.
struct Slow {
    current: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl Reconcile for Slow {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn reconcile(&self, _cancel: &CancellationToken, _req: &ReconcileRequest) -> Outcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Outcome::Success
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_is_bounded() {
    let slow = Arc::new(Slow { current: AtomicUsize::new(0), peak: AtomicUsize::new(0), done: AtomicUsize::new(0) });
    let ctl = Controller::new(slow.clone(), DispatchConfig { concurrency: 2, ..DispatchConfig::default() });
    let queue = ctl.queue();
    for i in 0..8 {
        queue.add(req(&format!("obj-{i}")));
    }
    let cancel = CancellationToken::new();
    let run = tokio::spawn(ctl.run(cancel.clone()));

    eventually(|| slow.done.load(Ordering::SeqCst) == 8).await;
    cancel.cancel();
    run.await.unwrap();

    assert_eq!(slow.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn feed_and_synchronizer_end_to_end() {
    let sources = Arc::new(MemoryStore::<Source>::new());
    let targets = Arc::new(MemoryStore::<Target>::new());
    let clusters = Arc::new(ClusterSet::new());
    clusters.insert(ClusterClient::new("source").with_sources(sources.clone()));
    clusters.insert(ClusterClient::new("target").with_targets(targets.clone()));

    let mut src = Source::new("a", SourceSpec { message: "hello".into(), additional_info: vec!["x".into()] });
    src.metadata.namespace = Some("ns".into());
    sources.put(src).unwrap();

    let sync = Arc::new(SourceSynchronizer::new(clusters, SyncOptions::default()));
    let ctl = Controller::new(sync, DispatchConfig::default());
    let (tx, rx) = mpsc::channel(16);
    let feed = ctl.spawn_feed(rx);
    let cancel = CancellationToken::new();
    let run = tokio::spawn(ctl.run(cancel.clone()));

    tx.send(req("a")).await.unwrap();
    let key = ObjectKey::new("ns", "a");
    eventually(|| targets.peek(&key).is_some()).await;
    let status = targets.peek(&key).unwrap().status.unwrap();
    assert_eq!(status.message, "hello");
    assert_eq!(status.additional_info, vec!["x"]);

    drop(tx);
    feed.await.unwrap();
    cancel.cancel();
    run.await.unwrap();
}
