//! Cache facade: hash-based dispatch over a power-of-two shard array.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock;
use crate::config::CacheConfig;
use crate::entry::NO_EXPIRY;
use crate::error::CacheError;
use crate::hasher::{DefaultHasher, KeyHasher};
use crate::shard::{RemoveCallback, Shard};
use crate::stats::Statistics;

/// Sharded in-memory cache storing byte values under string keys.
///
/// Keys are hashed with the configured [`KeyHasher`] and dispatched to one
/// of N shards (`hash & (N - 1)`); each shard serializes its own operations
/// behind an independent read-write lock.
pub struct Cache {
    shards: Box<[Arc<Shard>]>,
    mask: u64,
    hasher: Arc<dyn KeyHasher>,
    config: CacheConfig,
    shut: AtomicBool,
}

impl Cache {
    /// Create a builder with default configuration.
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Build a cache from `config` with the default hasher.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        CacheBuilder::new().config(config).build()
    }

    /// Look up `key`. Misses and hash collisions both report
    /// [`CacheError::NotFound`].
    pub fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let hash = self.hasher.sum64(key);
        self.shard_for(hash).get(key, hash)
    }

    /// Store `key` → `value` with the given time to live.
    ///
    /// A zero `ttl` means the entry never expires, unless the configured
    /// `life_window` substitutes a default. Returns the absolute expiry
    /// epoch second (`NO_EXPIRY` when the entry is permanent).
    pub fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64, CacheError> {
        let mut ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        if ttl_secs == 0 {
            ttl_secs = self.config.life_window;
        }
        let expiry = if ttl_secs == 0 {
            NO_EXPIRY
        } else {
            clock::epoch_secs() + ttl_secs
        };
        self.set_absolute(key, value, expiry)?;
        Ok(expiry)
    }

    /// Store `key` → `value` with an absolute expiry epoch second, bypassing
    /// TTL derivation. Used when applying writes that already carry an
    /// expiry computed elsewhere.
    pub fn set_absolute(&self, key: &str, value: &[u8], expiry: u64) -> Result<(), CacheError> {
        let hash = self.hasher.sum64(key);
        self.shard_for(hash).set(key, hash, value, expiry)
    }

    /// Remove `key` from the cache.
    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        let hash = self.hasher.sum64(key);
        self.shard_for(hash).delete(key, hash)
    }

    /// Number of live entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-shard counter snapshots plus their sum.
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        for shard in self.shards.iter() {
            let snapshot = shard.stats();
            stats.total.accumulate(&snapshot);
            stats.shards.push(snapshot);
        }
        stats
    }

    /// Drop every entry, keeping shard allocations.
    pub fn reset(&self) {
        for shard in self.shards.iter() {
            shard.reset(&self.config);
        }
    }

    /// Stop the per-shard TTL timers. Idempotent; entries stay readable but
    /// no further expiry fires.
    pub fn shut_down(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        for shard in self.shards.iter() {
            shard.shut_down();
        }
    }

    fn shard_for(&self, hash: u64) -> &Arc<Shard> {
        &self.shards[(hash & self.mask) as usize]
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Builder for [`Cache`].
pub struct CacheBuilder {
    config: CacheConfig,
    hasher: Option<Arc<dyn KeyHasher>>,
    on_remove: Option<RemoveCallback>,
}

impl CacheBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            hasher: None,
            on_remove: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject the 64-bit key hasher.
    pub fn hasher(mut self, hasher: Arc<dyn KeyHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Install a removal hook, invoked with `(key, value)` when entries
    /// leave the cache.
    pub fn on_remove(mut self, callback: RemoveCallback) -> Self {
        self.on_remove = Some(callback);
        self
    }

    /// Validate the configuration and build the cache.
    pub fn build(self) -> Result<Cache, CacheError> {
        self.config.validate()?;
        let hasher = self
            .hasher
            .unwrap_or_else(|| Arc::new(DefaultHasher::new()));
        let shards: Box<[Arc<Shard>]> = (0..self.config.shards)
            .map(|id| {
                Shard::new(
                    id,
                    &self.config,
                    Arc::clone(&hasher),
                    self.on_remove.clone(),
                )
            })
            .collect();
        Ok(Cache {
            mask: (self.config.shards - 1) as u64,
            shards,
            hasher,
            config: self.config,
            shut: AtomicBool::new(false),
        })
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> Cache {
        let mut config = CacheConfig::default();
        config.shards = 8;
        Cache::new(config).unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let cache = test_cache();
        cache.set("key", b"value", Duration::ZERO).unwrap();
        assert_eq!(cache.get("key").unwrap(), b"value");
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        let cache = test_cache();
        let expiry = cache.set("key", b"value", Duration::ZERO).unwrap();
        assert_eq!(expiry, NO_EXPIRY);
    }

    #[test]
    fn test_life_window_substitutes_default_ttl() {
        let mut config = CacheConfig::default();
        config.shards = 4;
        config.life_window = 60;
        let cache = Cache::new(config).unwrap();

        let expiry = cache.set("key", b"value", Duration::ZERO).unwrap();
        assert!(expiry >= clock::epoch_secs() + 59);

        // An explicit TTL still wins over the default.
        let expiry = cache.set("key", b"value", Duration::from_secs(600)).unwrap();
        assert!(expiry >= clock::epoch_secs() + 599);
    }

    #[test]
    fn test_sub_second_ttl_rounds_up() {
        let cache = test_cache();
        let expiry = cache
            .set("key", b"value", Duration::from_millis(300))
            .unwrap();
        assert_ne!(expiry, NO_EXPIRY);
    }

    #[test]
    fn test_dispatch_spreads_keys() {
        let cache = test_cache();
        for i in 0..256 {
            let key = format!("key_{i}");
            cache.set(&key, b"v", Duration::ZERO).unwrap();
        }
        assert_eq!(cache.len(), 256);

        let stats = cache.statistics();
        assert_eq!(stats.shards.len(), 8);
        // With 256 keys over 8 shards every shard should hold something.
        for i in 0..256 {
            let key = format!("key_{i}");
            assert_eq!(cache.get(&key).unwrap(), b"v");
        }
        assert_eq!(cache.statistics().total.hits, 256);
    }

    #[test]
    fn test_delete() {
        let cache = test_cache();
        cache.set("key", b"value", Duration::ZERO).unwrap();
        cache.delete("key").unwrap();
        assert_eq!(cache.get("key"), Err(CacheError::NotFound));
        assert_eq!(cache.delete("key"), Err(CacheError::NotFound));
    }

    #[test]
    fn test_invalid_shard_count_rejected() {
        let mut config = CacheConfig::default();
        config.shards = 19;
        assert!(matches!(
            Cache::new(config),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reset_clears_everything() {
        let cache = test_cache();
        for i in 0..32 {
            cache
                .set(&format!("key_{i}"), b"v", Duration::ZERO)
                .unwrap();
        }
        cache.reset();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shut_down_is_idempotent() {
        let cache = test_cache();
        cache.set("key", b"value", Duration::ZERO).unwrap();
        cache.shut_down();
        cache.shut_down();
        // Entries remain readable after shutdown.
        assert_eq!(cache.get("key").unwrap(), b"value");
    }

    #[test]
    fn test_set_absolute_preserves_expiry() {
        let cache = test_cache();
        let expiry = clock::epoch_secs() + 3600;
        cache.set_absolute("key", b"value", expiry).unwrap();
        assert_eq!(cache.get("key").unwrap(), b"value");
    }
}
