//! Session and transaction context passed to access strategies.
//!
//! The ORM owns sessions and transactions; the cache only needs to know who
//! is calling, when their transaction started, and (for the transactional
//! strategy) where to stage writes until commit.

use gridcache_core::{
    new_id, CacheKey, CacheValue, ClusterTime, SessionId, Timestamper, TransactionId, Version,
};
use gridcache_storage::RegionCache;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Caller identity for one delegate operation.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: SessionId,
    tx_timestamp: ClusterTime,
    transaction: Option<Arc<Transaction>>,
}

impl SessionContext {
    pub fn new(session_id: SessionId, tx_timestamp: ClusterTime) -> Self {
        Self {
            session_id,
            tx_timestamp,
            transaction: None,
        }
    }

    /// New session whose transaction starts now on `clock`.
    pub fn open(clock: &dyn Timestamper) -> Self {
        Self::new(new_id(), clock.next_timestamp())
    }

    /// Attach an active transaction; transactional regions stage into it.
    pub fn with_transaction(mut self, transaction: Arc<Transaction>) -> Self {
        self.tx_timestamp = transaction.started_at();
        self.transaction = Some(transaction);
        self
    }

    pub fn id(&self) -> SessionId {
        self.session_id
    }

    pub fn tx_timestamp(&self) -> ClusterTime {
        self.tx_timestamp
    }

    /// The attached transaction, if it is still active.
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref().filter(|tx| tx.is_active())
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// A write held back until commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedWrite {
    Put {
        key: CacheKey,
        value: CacheValue,
        version: Option<Version>,
    },
    Insert {
        key: CacheKey,
        value: CacheValue,
        version: Option<Version>,
    },
    Remove {
        key: CacheKey,
    },
    Clear,
}

impl StagedWrite {
    fn key(&self) -> Option<&CacheKey> {
        match self {
            StagedWrite::Put { key, .. }
            | StagedWrite::Insert { key, .. }
            | StagedWrite::Remove { key } => Some(key),
            StagedWrite::Clear => None,
        }
    }
}

/// What a transaction's own staged writes say about a key.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedRead {
    Value(CacheValue),
    Removed,
}

/// Counts of staged writes applied at commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Writes that changed the region.
    pub applied: usize,
    /// Writes refused by newer cached state.
    pub discarded: usize,
    /// Writes lost to grid failures.
    pub failed: usize,
}

#[derive(Debug)]
struct StagedOp {
    region: Arc<RegionCache>,
    write: StagedWrite,
}

#[derive(Debug)]
struct TransactionState {
    status: TransactionStatus,
    staged: Vec<StagedOp>,
}

/// A unit of work whose cache writes are applied only on commit.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    session_id: SessionId,
    started_at: ClusterTime,
    clock: Arc<dyn Timestamper>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub fn begin(session_id: SessionId, clock: Arc<dyn Timestamper>) -> Arc<Self> {
        let started_at = clock.next_timestamp();
        Arc::new(Self {
            id: new_id(),
            session_id,
            started_at,
            clock,
            state: Mutex::new(TransactionState {
                status: TransactionStatus::Active,
                staged: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn started_at(&self) -> ClusterTime {
        self.started_at
    }

    pub fn status(&self) -> TransactionStatus {
        self.lock_state().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    pub fn staged_len(&self) -> usize {
        self.lock_state().staged.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stage a write against `region`. Returns false once the transaction
    /// is no longer active.
    pub fn stage(&self, region: Arc<RegionCache>, write: StagedWrite) -> bool {
        let mut state = self.lock_state();
        if state.status != TransactionStatus::Active {
            return false;
        }
        state.staged.push(StagedOp { region, write });
        true
    }

    /// Latest staged write for `key` in `region`, if any.
    pub fn staged_read(&self, region: &str, key: &CacheKey) -> Option<StagedRead> {
        let state = self.lock_state();
        state
            .staged
            .iter()
            .rev()
            .filter(|op| op.region.name() == region)
            .find_map(|op| match &op.write {
                StagedWrite::Put { value, .. } | StagedWrite::Insert { value, .. }
                    if op.write.key() == Some(key) =>
                {
                    Some(StagedRead::Value(value.clone()))
                }
                StagedWrite::Remove { key: removed } if removed == key => Some(StagedRead::Removed),
                StagedWrite::Clear => Some(StagedRead::Removed),
                _ => None,
            })
    }

    /// Apply staged writes in staging order.
    ///
    /// Grid failures do not abort the commit; each lost write is counted and
    /// logged, and the affected key is evicted locally by the region.
    pub async fn commit(&self) -> CommitSummary {
        let staged = {
            let mut state = self.lock_state();
            if state.status != TransactionStatus::Active {
                return CommitSummary::default();
            }
            state.status = TransactionStatus::Committed;
            std::mem::take(&mut state.staged)
        };

        let mut summary = CommitSummary::default();
        for op in staged {
            let region = op.region.name().to_string();
            let result = match op.write {
                StagedWrite::Put {
                    key,
                    value,
                    version,
                } => {
                    let ts = self.clock.next_timestamp();
                    op.region
                        .put(key, value, ts, version)
                        .await
                        .map(|o| o.is_written())
                }
                StagedWrite::Insert {
                    key,
                    value,
                    version,
                } => op
                    .region
                    .insert(key, value, version)
                    .await
                    .map(|o| o.is_written()),
                StagedWrite::Remove { key } => op
                    .region
                    .remove(&key, Some(self.session_id))
                    .await
                    .map(|_| true),
                StagedWrite::Clear => op.region.evict_all().await.map(|_| true),
            };
            match result {
                Ok(true) => summary.applied += 1,
                Ok(false) => summary.discarded += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        transaction_id = %self.id,
                        region = %region,
                        error = %err,
                        "Staged cache write lost at commit"
                    );
                }
            }
        }

        debug!(
            transaction_id = %self.id,
            applied = summary.applied,
            discarded = summary.discarded,
            failed = summary.failed,
            "Transaction committed"
        );
        summary
    }

    /// Discard staged writes. Returns how many were dropped.
    pub fn rollback(&self) -> usize {
        let mut state = self.lock_state();
        if state.status != TransactionStatus::Active {
            return 0;
        }
        state.status = TransactionStatus::RolledBack;
        let dropped = state.staged.len();
        state.staged.clear();
        debug!(transaction_id = %self.id, dropped = dropped, "Transaction rolled back");
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcache_core::{
        CacheDataDescription, GridCacheConfig, ManualTimestamper, RegionKind,
    };
    use gridcache_storage::InMemoryCluster;
    use serde_json::json;

    fn region(clock: Arc<ManualTimestamper>) -> Arc<RegionCache> {
        let cluster = InMemoryCluster::new();
        RegionCache::open(
            "app.Account",
            RegionKind::Entity,
            CacheDataDescription::mutable(),
            cluster.join().as_ref(),
            clock,
            &GridCacheConfig::new(),
        )
    }

    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let clock = ManualTimestamper::shared(1_000);
        let region = region(clock.clone());
        let tx = Transaction::begin(new_id(), clock.clone());
        let key = CacheKey::entity("Account", 1);

        tx.stage(
            region.clone(),
            StagedWrite::Put {
                key: key.clone(),
                value: json!("first"),
                version: None,
            },
        );
        tx.stage(
            region.clone(),
            StagedWrite::Put {
                key: key.clone(),
                value: json!("second"),
                version: None,
            },
        );
        assert_eq!(
            tx.staged_read(region.name(), &key),
            Some(StagedRead::Value(json!("second")))
        );
        assert_eq!(region.read(&key, i64::MAX).await.unwrap(), None);

        let summary = tx.commit().await;
        assert_eq!(summary.applied, 2);
        assert_eq!(tx.status(), TransactionStatus::Committed);
        assert_eq!(
            region.read(&key, i64::MAX).await.unwrap(),
            Some(json!("second"))
        );
    }

    #[tokio::test]
    async fn test_rollback_discards_and_closes() {
        let clock = ManualTimestamper::shared(1_000);
        let region = region(clock.clone());
        let tx = Transaction::begin(new_id(), clock.clone());
        let key = CacheKey::entity("Account", 1);

        tx.stage(region.clone(), StagedWrite::Remove { key: key.clone() });
        assert_eq!(tx.staged_read(region.name(), &key), Some(StagedRead::Removed));
        assert_eq!(tx.rollback(), 1);
        assert!(!tx.stage(region.clone(), StagedWrite::Clear));
        assert_eq!(tx.commit().await, CommitSummary::default());

        let session = SessionContext::new(new_id(), 5).with_transaction(tx);
        assert!(session.transaction().is_none());
    }
}
