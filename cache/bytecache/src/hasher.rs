//! Key hashing.
//!
//! The cache never hashes keys itself; shards consume 64-bit hashes computed
//! by an injected [`KeyHasher`]. This keeps the dispatch function and the
//! collision-detection path testable with a deliberately colliding hasher.

use ahash::RandomState;

/// Produces the 64-bit hash a key is stored and dispatched under.
pub trait KeyHasher: Send + Sync {
    /// Hash a key to 64 bits.
    fn sum64(&self, key: &str) -> u64;
}

/// Default hasher backed by ahash with fixed seeds.
///
/// Seeds are fixed so hashes are stable for the lifetime of the process;
/// hashes are never exchanged between processes.
#[derive(Clone)]
pub struct DefaultHasher {
    state: RandomState,
}

impl DefaultHasher {
    /// Create the default hasher.
    pub fn new() -> Self {
        Self {
            state: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }
}

impl Default for DefaultHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyHasher for DefaultHasher {
    fn sum64(&self, key: &str) -> u64 {
        self.state.hash_one(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_within_process() {
        let h = DefaultHasher::new();
        assert_eq!(h.sum64("key_1"), h.sum64("key_1"));
        assert_ne!(h.sum64("key_1"), h.sum64("key_2"));
    }

    #[test]
    fn test_instances_agree() {
        let a = DefaultHasher::new();
        let b = DefaultHasher::new();
        assert_eq!(a.sum64("some key"), b.sum64("some key"));
    }
}
