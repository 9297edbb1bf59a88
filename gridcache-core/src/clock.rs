//! Cluster time sources.
//!
//! Every timestamp the cache compares (transaction start, value write time,
//! lock expiry, timestamps-region marks) comes from one `Timestamper` per
//! factory, so comparisons are made on a single clock.

use crate::ClusterTime;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of cluster timestamps in epoch milliseconds.
pub trait Timestamper: Send + Sync + std::fmt::Debug {
    /// Strictly greater than every value previously returned by this source.
    fn next_timestamp(&self) -> ClusterTime;

    /// Current time without advancing the sequence.
    fn now(&self) -> ClusterTime;
}

/// Wall-clock timestamper that never repeats or goes backwards.
#[derive(Debug, Default)]
pub struct SystemTimestamper {
    last: AtomicI64,
}

impl SystemTimestamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Timestamper> {
        Arc::new(Self::new())
    }
}

impl Timestamper for SystemTimestamper {
    fn next_timestamp(&self) -> ClusterTime {
        let wall = Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn now(&self) -> ClusterTime {
        Utc::now()
            .timestamp_millis()
            .max(self.last.load(Ordering::Acquire))
    }
}

/// Manually driven clock for deterministic tests.
///
/// `next_timestamp` ticks by one millisecond; `advance` jumps ahead.
#[derive(Debug)]
pub struct ManualTimestamper {
    current: AtomicI64,
}

impl ManualTimestamper {
    pub fn new(start: ClusterTime) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    pub fn shared(start: ClusterTime) -> Arc<Self> {
        Arc::new(Self::new(start))
    }

    pub fn advance(&self, by: Duration) -> ClusterTime {
        self.current
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel)
            + by.as_millis() as i64
    }
}

impl Timestamper for ManualTimestamper {
    fn next_timestamp(&self) -> ClusterTime {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn now(&self) -> ClusterTime {
        self.current.load(Ordering::Acquire)
    }
}
