//! Per-key exponential backoff for retryable outcomes.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tandem_core::ReconcileRequest;

pub struct Backoff {
    max: Duration,
    failures: Mutex<FxHashMap<ReconcileRequest, u32>>,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self { max, failures: Mutex::new(FxHashMap::default()) }
    }

    /// Delay before retrying `req`: `floor * 2^failures`, capped. Records one more failure.
    pub fn next_delay(&self, req: &ReconcileRequest, floor: Duration) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(req.clone()).or_insert(0);
        let factor = 1u32.checked_shl(*n).unwrap_or(u32::MAX);
        *n = n.saturating_add(1);
        floor.saturating_mul(factor).min(self.max)
    }

    pub fn forget(&self, req: &ReconcileRequest) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(req);
    }

    pub fn failures(&self, req: &ReconcileRequest) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(req)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::ObjectKey;

    #[test]
    fn doubles_until_capped_and_resets() {
        let b = Backoff::new(Duration::from_secs(5));
        let a = ReconcileRequest::new("source", ObjectKey::new("ns", "a"));
        let other = ReconcileRequest::new("source", ObjectKey::new("ns", "b"));
        let floor = Duration::from_secs(1);

        let delays: Vec<_> = (0..5).map(|_| b.next_delay(&a, floor)).collect();
        assert_eq!(delays, [1, 2, 4, 5, 5].map(Duration::from_secs));
        assert_eq!(b.next_delay(&other, floor), floor);

        b.forget(&a);
        assert_eq!(b.failures(&a), 0);
        assert_eq!(b.next_delay(&a, floor), floor);
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let b = Backoff::new(Duration::from_secs(300));
        let a = ReconcileRequest::new("source", ObjectKey::new("ns", "a"));
        for _ in 0..100 {
            assert!(b.next_delay(&a, Duration::from_millis(500)) <= Duration::from_secs(300));
        }
    }
}
