//! Deduplicating work queue keyed by reconcile request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tandem_core::ReconcileRequest;
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    /// FIFO of requests ready to hand out.
    order: VecDeque<ReconcileRequest>,
    /// Requests waiting to be processed (queued, or re-added while in flight).
    dirty: FxHashSet<ReconcileRequest>,
    /// Requests handed to a worker and not yet `done`.
    processing: FxHashSet<ReconcileRequest>,
    shutdown: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    ready: Notify,
}

/// Cloneable handle; all clones share one queue.
///
/// A request added while already queued is coalesced. A request added while a worker holds it
/// is parked and handed out again after that worker calls [`WorkQueue::done`].
#[derive(Clone, Default)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, req: ReconcileRequest) {
        let mut st = self.lock();
        if st.shutdown || st.dirty.contains(&req) {
            return;
        }
        st.dirty.insert(req.clone());
        if st.processing.contains(&req) {
            return;
        }
        st.order.push_back(req);
        drop(st);
        self.inner.ready.notify_one();
    }

    /// Add `req` once `delay` has elapsed.
    pub fn add_after(&self, req: ReconcileRequest, delay: Duration) {
        if delay.is_zero() {
            self.add(req);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(req);
        });
    }

    /// Next request, waiting if the queue is empty. `None` after shutdown.
    pub async fn get(&self) -> Option<ReconcileRequest> {
        loop {
            let notified = self.inner.ready.notified();
            {
                let mut st = self.lock();
                if let Some(req) = st.order.pop_front() {
                    st.dirty.remove(&req);
                    st.processing.insert(req.clone());
                    return Some(req);
                }
                if st.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `req` finished; re-queues it if it was added again meanwhile.
    pub fn done(&self, req: &ReconcileRequest) {
        let mut st = self.lock();
        st.processing.remove(req);
        if st.dirty.contains(req) && !st.shutdown {
            st.order.push_back(req.clone());
            drop(st);
            self.inner.ready.notify_one();
        }
    }

    /// Stop accepting requests and wake every waiting `get`.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.inner.ready.notify_waiters();
    }

    /// Requests ready to hand out.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::ObjectKey;

    fn req(name: &str) -> ReconcileRequest {
        ReconcileRequest::new("source", ObjectKey::new("ns", name))
    }

    #[tokio::test]
    async fn duplicates_coalesce_in_fifo_order() {
        let q = WorkQueue::new();
        q.add(req("a"));
        q.add(req("b"));
        q.add(req("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(req("a")));
        assert_eq!(q.get().await, Some(req("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_keys_are_parked_until_done() {
        let q = WorkQueue::new();
        q.add(req("a"));
        let got = q.get().await.unwrap();
        q.add(req("a"));
        q.add(req("a"));
        assert_eq!(q.len(), 0, "must not hand out a key that is being processed");
        assert_eq!(q.in_flight(), 1);

        q.done(&got);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(req("a")));
        q.done(&req("a"));
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let q = WorkQueue::new();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add(req("late"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn delayed_add_fires() {
        let q = WorkQueue::new();
        q.add_after(req("a"), Duration::from_millis(20));
        assert!(q.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(2), q.get()).await.unwrap();
        assert_eq!(got, Some(req("a")));
    }
}
