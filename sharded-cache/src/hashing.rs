//! String hashing and shard-id generation.
//!
//! The same djb2 hash places keys in cache buckets and on the discovery
//! ring, so a key's ring position can be reproduced anywhere in the cluster.

use rand::Rng;

/// Upper bound (exclusive) of the shard-id space and of ring positions.
pub const RAND_MAX: u32 = i32::MAX as u32;

/// Identifier of a master shard; also its point on the ring.
pub type ShardId = u32;

const DJB2_SEED: u64 = 5831;

/// djb2 over the key bytes, with wrapping arithmetic.
pub fn djb2(key: &str) -> u64 {
    key.bytes().fold(DJB2_SEED, |hash, byte| {
        (hash << 5).wrapping_add(hash).wrapping_add(u64::from(byte))
    })
}

/// Position of `key` on the ring, in `[0, RAND_MAX)`.
pub fn ring_position(key: &str) -> u32 {
    (djb2(key) % u64::from(RAND_MAX)) as u32
}

/// Draws a fresh shard id uniformly from `[0, RAND_MAX)`.
pub fn random_shard_id<R: Rng + ?Sized>(rng: &mut R) -> ShardId {
    rng.gen_range(0..RAND_MAX)
}
