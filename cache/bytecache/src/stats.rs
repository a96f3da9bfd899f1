//! Per-shard cache statistics.
//!
//! Counters are word-sized atomics updated without holding the shard lock,
//! so a snapshot is coherent per counter but not serialized across counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter group owned by a shard.
#[derive(Default)]
pub(crate) struct ShardStats {
    hits: AtomicU64,
    misses: AtomicU64,
    del_hits: AtomicU64,
    del_misses: AtomicU64,
    collisions: AtomicU64,
    evictions: AtomicU64,
}

impl ShardStats {
    pub(crate) const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            del_hits: AtomicU64::new(0),
            del_misses: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn del_hit(&self) {
        self.del_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn del_miss(&self) {
        self.del_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            del_hits: self.del_hits.load(Ordering::Relaxed),
            del_misses: self.del_misses.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

}

/// Point-in-time snapshot of one shard's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Successful lookups.
    pub hits: u64,
    /// Lookups that found no entry.
    pub misses: u64,
    /// Successful deletes.
    pub del_hits: u64,
    /// Deletes that found no entry.
    pub del_misses: u64,
    /// Lookups rejected because a different key shared the hash.
    pub collisions: u64,
    /// Entries removed by TTL eviction.
    pub evictions: u64,
}

impl Stats {
    pub(crate) fn accumulate(&mut self, other: &Stats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.del_hits += other.del_hits;
        self.del_misses += other.del_misses;
        self.collisions += other.collisions;
        self.evictions += other.evictions;
    }
}

/// Cache-wide statistics: one snapshot per shard plus the sum.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Per-shard snapshots, indexed by shard.
    pub shards: Vec<Stats>,
    /// Counters summed across all shards.
    pub total: Stats,
}
