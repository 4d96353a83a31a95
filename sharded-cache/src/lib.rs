//! A sharded, replicated in-memory key/value cache.
//!
//! A configuration service keeps the list of master shards sorted on a hash
//! ring and tells clients which shard owns a key. Each master replicates its
//! writes to up to three followers, which also serve reads. Every process
//! talks the same length-prefixed binary protocol over TCP and serves
//! connections from a fixed worker pool.
//!
//! - [`lru`]: the per-shard cache
//! - [`registry`] and [`config_service`]: membership, heartbeats, discovery
//! - [`shard`]: the master/follower server
//! - [`client`] and [`shell`]: the client side
//! - [`protocol`]: message framing
//! - [`pool`]: accept loop, connection queue and workers

pub mod cli;
pub mod client;
pub mod config_service;
pub mod hashing;
pub mod lru;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod settings;
pub mod shard;
pub mod shell;
