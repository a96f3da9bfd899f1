//! Peer-to-peer clustering for the `bytecache` storage engine.
//!
//! Each process embeds a [`ClusterNode`] that owns a local sharded cache
//! and federates with other nodes over a length-prefixed binary protocol.
//! Writes replicate to connected peers; reads that miss locally fan out to
//! peers and resolve with the first non-empty reply. Replication is
//! best-effort: the cluster favors availability over consistency.
//!
//! # Example
//!
//! ```no_run
//! use cluster::{ClusterConfig, ClusterNode};
//! use std::time::Duration;
//!
//! let mut config = ClusterConfig::default();
//! config.local_port = 9911;
//! let node = ClusterNode::new(config);
//! node.start().unwrap();
//!
//! node.put("greeting", b"hello", Duration::from_secs(60)).unwrap();
//! let value = node.get("greeting", Duration::from_millis(200)).unwrap();
//! assert_eq!(value, b"hello");
//!
//! node.shut_down();
//! ```

#![warn(clippy::all)]

pub mod logging;

mod comms;
mod config;
mod error;
mod node;
mod peer;

pub use config::{ClusterConfig, ReplicationMode};
pub use error::ClusterError;
pub use node::ClusterNode;

// The storage engine's public knobs, re-exported for embedders.
pub use bytecache::{CacheConfig, Stats, Statistics};
