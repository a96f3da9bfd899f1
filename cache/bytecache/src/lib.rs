//! Sharded in-memory cache with per-shard byte arenas.
//!
//! Entries are packed into one contiguous, growable byte arena per shard
//! and indexed by a hash→offset map, so the entry count puts no pressure on
//! the allocator. Each shard carries its own read-write lock, its own
//! statistics, and a TTL table that fires a single timer for the whole
//! shard regardless of how many entries carry an expiry.
//!
//! # Example
//!
//! ```
//! use bytecache::{Cache, CacheConfig};
//! use std::time::Duration;
//!
//! let mut config = CacheConfig::default();
//! config.shards = 8;
//! let cache = Cache::new(config).unwrap();
//!
//! cache.set("greeting", b"hello", Duration::from_secs(3600)).unwrap();
//! assert_eq!(cache.get("greeting").unwrap(), b"hello");
//!
//! cache.delete("greeting").unwrap();
//! assert!(cache.get("greeting").is_err());
//! ```

#![warn(clippy::all)]

mod cache;
mod clock;
mod config;
mod entry;
mod error;
mod hasher;
mod queue;
mod shard;
mod stats;
mod ttl;

pub use cache::{Cache, CacheBuilder};
pub use config::{CacheConfig, parse_size};
pub use entry::NO_EXPIRY;
pub use error::CacheError;
pub use hasher::{DefaultHasher, KeyHasher};
pub use shard::RemoveCallback;
pub use stats::{Statistics, Stats};
