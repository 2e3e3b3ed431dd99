//! Consistent hashing of point ids onto shards.
//!
//! Each shard is represented by multiple virtual nodes (vnodes) so that
//! adding or removing one shard only moves the keys adjacent to its vnodes.

use crate::types::{PointId, ShardId};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per shard.
pub const DEFAULT_VNODES_PER_SHARD: usize = 128;

/// A consistent hash ring mapping point ids to shard ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    /// Hash position on the ring to owning shard.
    vnodes: BTreeMap<u64, ShardId>,

    vnodes_per_shard: usize,

    /// Shards on the ring, sorted.
    shards: Vec<ShardId>,
}

impl HashRing {
    /// Create an empty ring with the default vnode count.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_SHARD)
    }

    /// Create an empty ring with a custom vnode count.
    pub fn with_vnodes(vnodes_per_shard: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_shard: vnodes_per_shard.max(1),
            shards: Vec::new(),
        }
    }

    /// Create a ring containing the given shards.
    pub fn from_shards(vnodes_per_shard: usize, shards: impl IntoIterator<Item = ShardId>) -> Self {
        let mut ring = Self::with_vnodes(vnodes_per_shard);
        for shard_id in shards {
            ring.add_shard(shard_id);
        }
        ring
    }

    /// Number of shards on the ring.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the ring has no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// All shards on the ring, sorted.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Virtual nodes placed for each shard.
    pub fn vnodes_per_shard(&self) -> usize {
        self.vnodes_per_shard
    }

    /// Check if a shard is on the ring.
    pub fn contains_shard(&self, shard_id: ShardId) -> bool {
        self.shards.binary_search(&shard_id).is_ok()
    }

    /// Add a shard to the ring. No-op if already present.
    pub fn add_shard(&mut self, shard_id: ShardId) {
        if let Err(pos) = self.shards.binary_search(&shard_id) {
            self.shards.insert(pos, shard_id);
            for i in 0..self.vnodes_per_shard {
                self.vnodes.insert(Self::vnode_hash(shard_id, i), shard_id);
            }
        }
    }

    /// Remove a shard from the ring. No-op if absent.
    pub fn remove_shard(&mut self, shard_id: ShardId) {
        if let Ok(pos) = self.shards.binary_search(&shard_id) {
            self.shards.remove(pos);
            self.vnodes.retain(|_, owner| *owner != shard_id);
        }
    }

    /// Shard owning a point, or `None` if the ring is empty.
    pub fn route(&self, point_id: &PointId) -> Option<ShardId> {
        let hash = Self::hash_bytes(&point_id.routing_bytes());
        self.owner_at(hash)
    }

    /// Count of sample keys routed to each shard.
    pub fn distribution(&self, sample_size: u64) -> BTreeMap<ShardId, usize> {
        let mut distribution = BTreeMap::new();
        for i in 0..sample_size {
            if let Some(shard_id) = self.route(&PointId::Num(i)) {
                *distribution.entry(shard_id).or_insert(0) += 1;
            }
        }
        distribution
    }

    fn owner_at(&self, hash: u64) -> Option<ShardId> {
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, &shard_id)| shard_id)
    }

    fn vnode_hash(shard_id: ShardId, vnode: usize) -> u64 {
        Self::hash_bytes(format!("shard-{}:{}", shard_id, vnode).as_bytes())
    }

    fn hash_bytes(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}
