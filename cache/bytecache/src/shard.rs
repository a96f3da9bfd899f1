//! Cache shard: one independently locked partition.
//!
//! A shard owns a hash→index map and a [`ByteQueue`] arena, guarded together
//! by a single read-write lock. Stats counters are atomics updated outside
//! the lock. TTL registration happens through the shard's [`TtlTable`],
//! which is never invoked while its own lock is held by the shard path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::CacheConfig;
use crate::entry::{self, NO_EXPIRY};
use crate::error::CacheError;
use crate::hasher::KeyHasher;
use crate::queue::ByteQueue;
use crate::stats::{ShardStats, Stats};
use crate::ttl::TtlTable;

/// Hook invoked with `(key, value)` whenever an entry leaves the cache
/// through delete, TTL eviction, or oldest-entry displacement.
pub type RemoveCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

pub(crate) struct Shard {
    inner: RwLock<ShardInner>,
    stats: ShardStats,
    ttl: Arc<TtlTable>,
    hasher: Arc<dyn KeyHasher>,
    on_remove: Option<RemoveCallback>,
    verbose: bool,
}

struct ShardInner {
    map: HashMap<u64, usize, ahash::RandomState>,
    queue: ByteQueue,
    // Reusable pack buffer; only ever touched under the write lock.
    scratch: Vec<u8>,
}

impl Shard {
    pub(crate) fn new(
        id: usize,
        config: &CacheConfig,
        hasher: Arc<dyn KeyHasher>,
        on_remove: Option<RemoveCallback>,
    ) -> Arc<Shard> {
        let ttl = TtlTable::new();
        let shard = Arc::new(Shard {
            inner: RwLock::new(ShardInner {
                map: HashMap::default(),
                queue: ByteQueue::new(config.initial_shard_bytes(), config.max_shard_bytes()),
                scratch: Vec::with_capacity(config.max_entry_size + entry::HEADERS_SIZE),
            }),
            stats: ShardStats::new(),
            ttl: Arc::clone(&ttl),
            hasher,
            on_remove,
            verbose: config.verbose,
        });
        ttl.spawn_timer(Arc::downgrade(&shard), id);
        shard
    }

    /// Look up `key` under the read lock.
    ///
    /// A hash hit with mismatched key bytes is a collision: counted and
    /// reported as [`CacheError::NotFound`].
    pub(crate) fn get(&self, key: &str, hash: u64) -> Result<Vec<u8>, CacheError> {
        let inner = self.inner.read();
        let mut collision = false;
        let value = inner
            .map
            .get(&hash)
            .copied()
            .and_then(|index| inner.queue.get(index).ok())
            .and_then(|wrapped| {
                let stored_key = entry::key(wrapped);
                if stored_key == key {
                    Some(entry::value(wrapped).to_vec())
                } else {
                    if self.verbose {
                        tracing::warn!(key, stored_key, hash, "hash collision detected");
                    }
                    collision = true;
                    None
                }
            });
        drop(inner);

        match value {
            Some(value) => {
                self.stats.hit();
                Ok(value)
            }
            None if collision => {
                self.stats.collision();
                Err(CacheError::NotFound)
            }
            None => {
                self.stats.miss();
                Err(CacheError::NotFound)
            }
        }
    }

    /// Store `key` → `value` with an absolute `expiry` epoch second
    /// (`NO_EXPIRY` = never).
    ///
    /// Any prior entry for this hash is invalidated first; if the subsequent
    /// push fails with `QueueFull` the prior entry is not restored.
    pub(crate) fn set(
        &self,
        key: &str,
        hash: u64,
        value: &[u8],
        expiry: u64,
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.write();

        if let Some(prev_index) = inner.map.get(&hash).copied() {
            let prior = inner
                .queue
                .get(prev_index)
                .ok()
                .map(|w| (entry::expiry(w), entry::key(w).to_owned()));
            if let Some((prev_expiry, prev_key)) = prior {
                if prev_expiry != NO_EXPIRY {
                    self.ttl.remove(prev_expiry, &prev_key);
                }
                let _ = inner.queue.delete(prev_index);
            }
            inner.map.remove(&hash);
        }

        let mut scratch = std::mem::take(&mut inner.scratch);
        let packed = entry::wrap(expiry, hash, key, value, &mut scratch);
        let pushed = inner.queue.push(&scratch[..packed]);
        inner.scratch = scratch;

        match pushed {
            Ok(index) => {
                inner.map.insert(hash, index);
            }
            Err(_) => {
                drop(inner);
                return Err(CacheError::QueueFull);
            }
        }
        drop(inner);

        if expiry != NO_EXPIRY {
            self.ttl.put(expiry, key);
        }
        Ok(())
    }

    /// Remove `key` from the shard.
    pub(crate) fn delete(&self, key: &str, hash: u64) -> Result<(), CacheError> {
        let mut inner = self.inner.write();
        let found = inner.map.get(&hash).copied().and_then(|index| {
            inner
                .queue
                .get(index)
                .ok()
                .map(|w| (index, entry::expiry(w), entry::value(w).to_vec()))
        });
        let Some((index, expiry, removed_value)) = found else {
            drop(inner);
            self.stats.del_miss();
            return Err(CacheError::NotFound);
        };
        inner.map.remove(&hash);
        let _ = inner.queue.delete(index);
        drop(inner);

        if expiry != NO_EXPIRY {
            self.ttl.remove(expiry, key);
        }
        self.stats.del_hit();
        if let Some(on_remove) = &self.on_remove {
            on_remove(key, &removed_value);
        }
        Ok(())
    }

    /// Evict every key of a cohort whose stored expiry still matches
    /// `expiry`. Called by the TTL timer with no TTL lock held.
    pub(crate) fn evict_cohort(&self, expiry: u64, keys: &HashSet<String>) {
        let mut removed: Vec<(String, Vec<u8>)> = Vec::new();
        let mut inner = self.inner.write();
        for key in keys {
            self.stats.eviction();
            let hash = self.hasher.sum64(key);
            let Some(index) = inner.map.get(&hash).copied() else {
                self.stats.del_miss();
                continue;
            };
            let Ok(wrapped) = inner.queue.get(index) else {
                self.stats.del_miss();
                continue;
            };
            if entry::expiry(wrapped) != expiry {
                // Overwritten with a fresh expiry since this cohort was built.
                continue;
            }
            let value = entry::value(wrapped).to_vec();
            inner.map.remove(&hash);
            let _ = inner.queue.delete(index);
            self.stats.del_hit();
            removed.push((key.clone(), value));
        }
        drop(inner);

        if let Some(on_remove) = &self.on_remove {
            for (key, value) in removed {
                on_remove(&key, &value);
            }
        }
    }

    /// Pop the oldest live entry and unlink it from the map.
    #[allow(dead_code)]
    pub(crate) fn remove_oldest(&self) -> Result<(), CacheError> {
        let popped = {
            let mut inner = self.inner.write();
            let data = inner.queue.pop()?;
            let hash = entry::hash(&data);
            inner.map.remove(&hash);
            data
        };
        if let Some(on_remove) = &self.on_remove {
            on_remove(entry::key(&popped), entry::value(&popped));
        }
        Ok(())
    }

    /// Copy of the oldest live entry's value, without removing it.
    #[allow(dead_code)]
    pub(crate) fn oldest(&self) -> Result<Vec<u8>, CacheError> {
        let mut inner = self.inner.write();
        inner.queue.peek().map(|w| entry::value(w).to_vec())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub(crate) fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Snapshot of the live queue indices, for introspection.
    #[allow(dead_code)]
    pub(crate) fn copy_indices(&self) -> Vec<usize> {
        let inner = self.inner.read();
        let mut indices: Vec<usize> = inner.map.values().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Drop all entries and re-size the scratch buffer for `config`.
    pub(crate) fn reset(&self, config: &CacheConfig) {
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.queue.reset();
        inner.scratch = Vec::with_capacity(config.max_entry_size + entry::HEADERS_SIZE);
        drop(inner);
        self.ttl.reset();
    }

    pub(crate) fn shut_down(&self) {
        self.ttl.shut_down();
    }
}
