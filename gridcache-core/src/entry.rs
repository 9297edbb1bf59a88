//! Entries stored in a region's distributed map.
//!
//! A key either holds a value, holds a soft-lock marker, or is absent (no
//! entry at all). Keeping locks in the same slot as values lets every member
//! observe an in-flight write through the map alone, and the sum type makes
//! it impossible to hand a lock marker out as a value.
//!
//! # Lock marker lifecycle
//!
//! ```text
//! (absent|value) ── lock ──→ Held(1) ── lock ──→ Held(n) (concurrent)
//!                               │                   │
//!                         update(token)    update(token) | unlock(token)
//!                               ↓                   ↓
//!                            value            Released(expires_at = now)
//! ```
//!
//! Once a second session joins a marker it stays concurrent until released,
//! even after holders drop out: no holder of a shared marker writes through.
//!
//! A released marker stays in the map so that a load by a transaction that
//! began before the release cannot re-cache pre-write state.

use crate::{CacheValue, ClusterTime, LockId, SessionId, Version, VersionComparator};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// VALUE
// ============================================================================

/// A cached value with the version and cluster time it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: CacheValue,
    pub version: Option<Version>,
    pub timestamp: ClusterTime,
}

impl VersionedValue {
    pub fn new(value: CacheValue, version: Option<Version>, timestamp: ClusterTime) -> Self {
        Self {
            value,
            version,
            timestamp,
        }
    }

    /// The value as seen by a transaction that started at `tx_timestamp`.
    ///
    /// Transactions older than the write do not see it.
    pub fn visible_to(&self, tx_timestamp: ClusterTime) -> Option<&CacheValue> {
        (self.timestamp <= tx_timestamp).then_some(&self.value)
    }
}

// ============================================================================
// LOCK MARKER
// ============================================================================

/// Soft-lock record stored in place of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMarker {
    pub lock_id: LockId,
    pub owner: SessionId,
    pub version: Option<Version>,
    pub locked_at: ClusterTime,
    /// Lock timeout for held markers, release time for released ones.
    pub expires_at: ClusterTime,
    /// Number of sessions currently holding the marker.
    pub holders: u32,
    /// Set once a second session joined; never cleared.
    #[serde(default)]
    pub concurrent: bool,
}

impl LockMarker {
    pub fn new(
        owner: SessionId,
        version: Option<Version>,
        now: ClusterTime,
        timeout: Duration,
    ) -> Self {
        Self {
            lock_id: Uuid::now_v7(),
            owner,
            version,
            locked_at: now,
            expires_at: now.saturating_add(timeout.as_millis() as i64),
            holders: 1,
            concurrent: false,
        }
    }

    /// Check if the marker no longer protects anything at `now`.
    pub fn is_expired(&self, now: ClusterTime) -> bool {
        now >= self.expires_at
    }

    /// Calculate remaining time until expiry.
    pub fn remaining_duration(&self, now: ClusterTime) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            Some(Duration::from_millis((self.expires_at - now) as u64))
        }
    }

    pub fn is_released(&self) -> bool {
        self.holders == 0
    }

    /// More than one session locked the key at some point; nobody may write
    /// through it.
    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    pub fn matches(&self, lock: &SoftLock) -> bool {
        self.lock_id == lock.lock_id
    }

    /// Add a holder to a live marker, extending it to the later expiry.
    pub fn join(mut self, now: ClusterTime, timeout: Duration) -> Self {
        self.holders += 1;
        self.concurrent = true;
        self.expires_at = self
            .expires_at
            .max(now.saturating_add(timeout.as_millis() as i64));
        self
    }

    /// Drop one holder; the last one turns the marker into a released marker.
    pub fn release(mut self, now: ClusterTime) -> Self {
        self.holders = self.holders.saturating_sub(1);
        if self.holders == 0 {
            self.expires_at = now;
        }
        self
    }

    /// Token handed to `owner` for this marker.
    pub fn token(&self, owner: SessionId) -> SoftLock {
        SoftLock {
            lock_id: self.lock_id,
            owner,
            expires_at: self.expires_at,
        }
    }
}

/// Token proving which marker a session locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftLock {
    pub lock_id: LockId,
    pub owner: SessionId,
    pub expires_at: ClusterTime,
}

// ============================================================================
// ENTRY
// ============================================================================

/// What a region's distributed map stores under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEntry {
    Value(VersionedValue),
    Locked(LockMarker),
}

impl CacheEntry {
    /// The readable value for a transaction started at `tx_timestamp`.
    pub fn readable(&self, tx_timestamp: ClusterTime) -> Option<&CacheValue> {
        match self {
            CacheEntry::Value(v) => v.visible_to(tx_timestamp),
            CacheEntry::Locked(_) => None,
        }
    }

    pub fn version(&self) -> Option<&Version> {
        match self {
            CacheEntry::Value(v) => v.version.as_ref(),
            CacheEntry::Locked(m) => m.version.as_ref(),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, CacheEntry::Locked(_))
    }

    /// Whether a write from a transaction started at `tx_timestamp` carrying
    /// `version` may replace this entry.
    ///
    /// Values compare versions when both sides have one and a comparator is
    /// known, and fall back to write time otherwise. Markers are replaceable
    /// only by transactions that began after the marker expired or was
    /// released.
    pub fn is_replaceable_by(
        &self,
        tx_timestamp: ClusterTime,
        version: Option<&Version>,
        comparator: Option<&dyn VersionComparator>,
    ) -> bool {
        match self {
            CacheEntry::Value(stored) => match (version, comparator) {
                (Some(incoming), Some(cmp)) => match &stored.version {
                    Some(current) => cmp.compare(current, incoming) == Ordering::Less,
                    None => true,
                },
                _ => stored.timestamp < tx_timestamp,
            },
            CacheEntry::Locked(marker) => marker.expires_at < tx_timestamp,
        }
    }
}

/// Result of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The map now holds the written state.
    Written,
    /// The stored state is as new or newer; nothing changed.
    StaleDiscarded,
    /// A live soft lock guards the key; nothing changed.
    Locked,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written)
    }
}

/// Result of a region lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
}

impl CacheLookup {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            CacheLookup::Hit(entry) => Some(entry),
            CacheLookup::Miss => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            CacheLookup::Hit(entry) => Some(entry),
            CacheLookup::Miss => None,
        }
    }
}
