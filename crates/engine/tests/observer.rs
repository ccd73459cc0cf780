use std::sync::Arc;

use tandem_core::{ObjectKey, ReconcileRequest, StoreError, Target, TargetStatus};
use tandem_engine::{CallPolicy, Outcome, Reconcile, TargetObserver};
use tandem_kubehub::{ClusterClient, ClusterSet};
use tandem_store::{MemoryStore, Op};
use tokio_util::sync::CancellationToken;

fn setup() -> (Arc<MemoryStore<Target>>, TargetObserver) {
    let targets = Arc::new(MemoryStore::<Target>::new());
    let clusters = Arc::new(ClusterSet::new());
    clusters.insert(ClusterClient::new("target").with_targets(targets.clone()));
    (targets, TargetObserver::new(clusters, CallPolicy::default()))
}

fn req(name: &str) -> ReconcileRequest {
    ReconcileRequest::new("target", ObjectKey::new("ns", name))
}

#[tokio::test]
async fn observing_never_writes() {
    let (targets, observer) = setup();
    let key = ObjectKey::new("ns", "a");
    let stored = targets
        .put(Target::projected(&key, TargetStatus { message: "hello".into(), ..Default::default() }))
        .unwrap();

    let seen = observer.observe(&CancellationToken::new(), &req("a")).await.unwrap();
    assert_eq!(seen.status.unwrap().message, "hello");
    assert!(observer.reconcile(&CancellationToken::new(), &req("a")).await.is_success());

    let calls = targets.calls();
    assert_eq!((calls.create, calls.update_status), (0, 0));
    assert_eq!(targets.peek(&key).unwrap().metadata.resource_version, stored.metadata.resource_version);
}

#[tokio::test]
async fn missing_target_is_retried() {
    let (targets, observer) = setup();
    let err = observer.observe(&CancellationToken::new(), &req("gone")).await.unwrap_err();
    assert!(err.is_not_found());
    let outcome = observer.reconcile(&CancellationToken::new(), &req("gone")).await;
    assert!(matches!(outcome, Outcome::RetryAfter(_)));
    assert!(targets.is_empty());
}

#[tokio::test]
async fn fetch_failures_are_retried() {
    let (targets, observer) = setup();
    targets.fail_next(Op::Get, StoreError::Transient("connection refused".into()));
    let outcome = observer.reconcile(&CancellationToken::new(), &req("a")).await;
    assert!(matches!(outcome, Outcome::RetryAfter(_)));
}

#[tokio::test]
async fn rejected_fetch_is_retried() {
    let (targets, observer) = setup();
    let key = ObjectKey::new("ns", "a");
    targets.put(Target::projected(&key, TargetStatus::default())).unwrap();
    targets.fail_next(Op::Get, StoreError::Rejected("Forbidden (403): rbac".into()));
    let outcome = observer.reconcile(&CancellationToken::new(), &req("a")).await;
    assert!(matches!(outcome, Outcome::RetryAfter(_)));
    assert!(observer.reconcile(&CancellationToken::new(), &req("a")).await.is_success());
}

#[tokio::test]
async fn source_cluster_does_not_serve_targets() {
    let clusters = Arc::new(ClusterSet::new());
    clusters.insert(ClusterClient::new("source"));
    let observer = TargetObserver::new(clusters, CallPolicy::default());
    let outcome = observer
        .reconcile(&CancellationToken::new(), &ReconcileRequest::new("source", ObjectKey::new("ns", "a")))
        .await;
    assert!(matches!(outcome, Outcome::Fatal(_)));
}
