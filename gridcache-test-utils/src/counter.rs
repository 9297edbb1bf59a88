//! Per-region invalidation event counts.

use gridcache_storage::{Grid, InvalidationEvent, TopicSubscription};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast::error::TryRecvError;

struct Watched {
    subscription: TopicSubscription,
    received: Vec<InvalidationEvent>,
}

/// Subscribes to region topics and counts what is published on them.
///
/// Subscriptions only see events published after [`InvalidationCounter::watch`],
/// so setup traffic can be excluded by watching after setup or by calling
/// [`InvalidationCounter::reset`]. Topic delivery is synchronous on the
/// in-memory cluster, so counts are exact once the publishing call returns.
#[derive(Default)]
pub struct InvalidationCounter {
    regions: Mutex<BTreeMap<String, Watched>>,
}

impl std::fmt::Debug for InvalidationCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationCounter")
            .field("regions", &self.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl InvalidationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter already watching `regions` on `grid`.
    pub fn watching<'a>(grid: &dyn Grid, regions: impl IntoIterator<Item = &'a str>) -> Self {
        let counter = Self::new();
        for region in regions {
            counter.watch(grid, region);
        }
        counter
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Watched>> {
        self.regions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start counting events on `region`'s topic. Watching twice restarts
    /// the count.
    pub fn watch(&self, grid: &dyn Grid, region: &str) {
        let watched = Watched {
            subscription: grid.topic(region).subscribe(),
            received: Vec::new(),
        };
        self.lock().insert(region.to_string(), watched);
    }

    fn drain(watched: &mut Watched) {
        loop {
            match watched.subscription.try_recv() {
                Ok(event) => watched.received.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Events published on `region` so far; zero if it is not watched.
    pub fn count(&self, region: &str) -> usize {
        let mut regions = self.lock();
        match regions.get_mut(region) {
            Some(watched) => {
                Self::drain(watched);
                watched.received.len()
            }
            None => 0,
        }
    }

    /// Events received on `region`, oldest first.
    pub fn events(&self, region: &str) -> Vec<InvalidationEvent> {
        let mut regions = self.lock();
        match regions.get_mut(region) {
            Some(watched) => {
                Self::drain(watched);
                watched.received.clone()
            }
            None => Vec::new(),
        }
    }

    /// Counts for every watched region.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut regions = self.lock();
        regions
            .iter_mut()
            .map(|(name, watched)| {
                Self::drain(watched);
                (name.clone(), watched.received.len())
            })
            .collect()
    }

    /// Forget everything received so far on every watched region.
    pub fn reset(&self) {
        for watched in self.lock().values_mut() {
            Self::drain(watched);
            watched.received.clear();
        }
    }
}
