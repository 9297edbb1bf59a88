//! Near-cache cleanup background task.
//!
//! Periodically walks every registered region and drops near-cache entries
//! that outlived their TTL, then trims regions that grew past their maximum
//! size. Runs until the shutdown signal is received.
//!
//! ```rust,ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(cleanup_task(registry, Duration::from_secs(60), shutdown_rx));
//! // Later, trigger shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::near_cache::CleanupReport;

/// A region whose local state can be cleaned up.
pub trait Cleanable: Send + Sync {
    fn name(&self) -> &str;

    fn cleanup(&self) -> CleanupReport;
}

/// Regions the cleanup task visits.
///
/// Holds weak references so a destroyed region drops out on its own.
#[derive(Default)]
pub struct CleanupRegistry {
    regions: RwLock<Vec<Weak<dyn Cleanable>>>,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("regions", &self.len())
            .finish()
    }
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, region: Arc<dyn Cleanable>) {
        self.regions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::downgrade(&region));
    }

    /// Live regions.
    pub fn len(&self) -> usize {
        self.regions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clean every live region once, forgetting dropped ones.
    pub fn run_once(&self, metrics: &CleanupMetrics) -> CleanupReport {
        let live: Vec<Arc<dyn Cleanable>> = {
            let mut regions = self.regions.write().unwrap_or_else(|p| p.into_inner());
            regions.retain(|w| w.strong_count() > 0);
            regions.iter().filter_map(Weak::upgrade).collect()
        };

        let mut total = CleanupReport::default();
        for region in live {
            let report = region.cleanup();
            if report.total() > 0 {
                tracing::debug!(
                    region = region.name(),
                    expired = report.expired,
                    trimmed = report.trimmed,
                    "Near-cache cleaned"
                );
            }
            total.expired += report.expired;
            total.trimmed += report.trimmed;
        }

        metrics
            .entries_expired
            .fetch_add(total.expired as u64, Ordering::Relaxed);
        metrics
            .entries_trimmed
            .fetch_add(total.trimmed as u64, Ordering::Relaxed);
        metrics.cleanup_cycles.fetch_add(1, Ordering::Relaxed);
        total
    }
}

/// Metrics for near-cache cleanup.
#[derive(Debug, Default)]
pub struct CleanupMetrics {
    /// Total entries dropped for exceeding their TTL
    pub entries_expired: AtomicU64,

    /// Total entries dropped to respect the size limit
    pub entries_trimmed: AtomicU64,

    /// Total cleanup cycles completed
    pub cleanup_cycles: AtomicU64,
}

impl CleanupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CleanupSnapshot {
        CleanupSnapshot {
            entries_expired: self.entries_expired.load(Ordering::Relaxed),
            entries_trimmed: self.entries_trimmed.load(Ordering::Relaxed),
            cleanup_cycles: self.cleanup_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cleanup metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSnapshot {
    pub entries_expired: u64,
    pub entries_trimmed: u64,
    pub cleanup_cycles: u64,
}

/// Background task that periodically cleans every registered region.
///
/// Returns the metrics collected during the task's lifetime.
pub async fn cleanup_task(
    registry: Arc<CleanupRegistry>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CleanupMetrics> {
    let metrics = Arc::new(CleanupMetrics::new());

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = period.as_millis() as u64,
        regions = registry.len(),
        "Near-cache cleanup task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Near-cache cleanup task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                registry.run_once(&metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        entries_expired = snapshot.entries_expired,
        entries_trimmed = snapshot.entries_trimmed,
        cleanup_cycles = snapshot.cleanup_cycles,
        "Near-cache cleanup task completed"
    );

    metrics
}
