//! Memoization with a wall-clock staleness bound.

use crate::{ClusterTime, Timestamper};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Caches the result of a zero-argument computation for `ttl`.
///
/// The computation runs on the first call and again on the first call after
/// the cached result is older than `ttl`. Introspection counters use this so
/// that polling them does not walk every region on each request.
#[derive(Debug)]
pub struct Memoized<T> {
    ttl: Duration,
    clock: Arc<dyn Timestamper>,
    slot: Mutex<Option<(T, ClusterTime)>>,
}

impl<T: Clone> Memoized<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn Timestamper>) -> Self {
        Self {
            ttl,
            clock,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached result, recomputing it with `compute` when stale.
    pub fn get_or_refresh<F>(&self, compute: F) -> T
    where
        F: FnOnce() -> T,
    {
        let now = self.clock.now();
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((value, computed_at)) = slot.as_ref() {
            if now.saturating_sub(*computed_at) < self.ttl.as_millis() as i64 {
                return value.clone();
            }
        }
        let value = compute();
        *slot = Some((value.clone(), now));
        value
    }

    /// Forget the cached result so the next call recomputes.
    pub fn invalidate(&self) {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualTimestamper;
    use std::cell::Cell;

    #[test]
    fn test_memoized_recomputes_after_ttl() {
        let clock = ManualTimestamper::shared(0);
        let memo = Memoized::new(Duration::from_secs(30), clock.clone());
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            calls.get()
        };

        assert_eq!(memo.get_or_refresh(compute), 1);
        clock.advance(Duration::from_secs(29));
        assert_eq!(memo.get_or_refresh(compute), 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(memo.get_or_refresh(compute), 2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_memoized_invalidate() {
        let clock = ManualTimestamper::shared(0);
        let memo = Memoized::new(Duration::from_secs(30), clock);
        assert_eq!(memo.get_or_refresh(|| "first"), "first");
        memo.invalidate();
        assert_eq!(memo.get_or_refresh(|| "second"), "second");
    }
}
