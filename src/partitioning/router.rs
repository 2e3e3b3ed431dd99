//! Versioned read/write hash rings for a shard group.
//!
//! Outside resharding a group has a single ring. During resharding the router
//! holds the old and the new ring side by side, and the read and write rings
//! each point at one of them:
//!
//! ```text
//!  stage                    read ring   write ring
//!  ---------------------    ---------   ----------
//!  starting / transfers     old         old
//!  read committed           new         old
//!  write committed          new         new
//!  finished                 new (becomes the only ring)
//!  aborted                  old (becomes the only ring)
//! ```
//!
//! Writes go to both the old-ring and new-ring owner for as long as the
//! operation lives, so rolling back from any stage loses nothing.

use super::hashring::HashRing;
use crate::error::{Error, Result};
use crate::types::{PointId, ShardId};

/// A ring configuration tagged with a monotonically increasing version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRing {
    pub version: u64,
    pub ring: HashRing,
}

impl VersionedRing {
    pub fn new(version: u64, ring: HashRing) -> Self {
        Self { version, ring }
    }
}

/// Change applied to the ring by a resharding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingChange {
    AddShard(ShardId),
    RemoveShard(ShardId),
}

/// Read/write ring router for one shard group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRingRouter {
    old: VersionedRing,
    new: Option<VersionedRing>,
    read: VersionedRing,
    write: VersionedRing,
}

impl HashRingRouter {
    /// Router with a single ring at version 0.
    pub fn single(ring: HashRing) -> Self {
        let ring = VersionedRing::new(0, ring);
        Self {
            old: ring.clone(),
            new: None,
            read: ring.clone(),
            write: ring,
        }
    }

    /// Whether a resharding ring change is in flight.
    pub fn is_resharding(&self) -> bool {
        self.new.is_some()
    }

    /// Ring in force before the in-flight change. When idle, the only ring.
    pub fn old_ring(&self) -> &VersionedRing {
        &self.old
    }

    /// Ring installed by the in-flight change, if any.
    pub fn new_ring(&self) -> Option<&VersionedRing> {
        self.new.as_ref()
    }

    /// Ring reads are routed by. Switches at the read commit.
    pub fn read_ring(&self) -> &VersionedRing {
        &self.read
    }

    /// Ring that names the write owner. Switches at the write commit.
    pub fn write_ring(&self) -> &VersionedRing {
        &self.write
    }

    /// The ring after the in-flight change, or the current ring when idle.
    fn target(&self) -> &VersionedRing {
        self.new.as_ref().unwrap_or(&self.old)
    }

    /// Shards known to either ring, sorted.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.old.ring.shards().to_vec();
        if let Some(new) = &self.new {
            for &shard_id in new.ring.shards() {
                if !shards.contains(&shard_id) {
                    shards.push(shard_id);
                }
            }
        }
        shards.sort_unstable();
        shards
    }

    /// Owner under the old ring.
    pub fn route_old(&self, point_id: &PointId) -> Option<ShardId> {
        self.old.ring.route(point_id)
    }

    /// Owner once the in-flight change lands.
    pub fn route_new(&self, point_id: &PointId) -> Option<ShardId> {
        self.target().ring.route(point_id)
    }

    /// Shard serving reads for a point.
    pub fn route_read(&self, point_id: &PointId) -> Option<ShardId> {
        self.read.ring.route(point_id)
    }

    /// Shard that owns a point for writes.
    pub fn route_write(&self, point_id: &PointId) -> Option<ShardId> {
        self.write.ring.route(point_id)
    }

    /// Every shard a write of this point must reach. The write-ring owner comes first.
    pub fn write_targets(&self, point_id: &PointId) -> Vec<ShardId> {
        let mut targets = Vec::with_capacity(2);
        targets.extend(self.route_write(point_id));
        if self.is_resharding() {
            for shard_id in [self.route_old(point_id), self.route_new(point_id)]
                .into_iter()
                .flatten()
            {
                if !targets.contains(&shard_id) {
                    targets.push(shard_id);
                }
            }
        }
        targets
    }

    /// Install the new ring. Reads and writes stay on the old ring.
    pub fn start_resharding(&mut self, change: RingChange) -> Result<()> {
        if self.is_resharding() {
            return Err(Error::Internal("hash ring is already resharding".into()));
        }
        let mut ring = self.old.ring.clone();
        match change {
            RingChange::AddShard(shard_id) => {
                if ring.contains_shard(shard_id) {
                    return Err(Error::bad_request(format!("shard {} already on hash ring", shard_id)));
                }
                ring.add_shard(shard_id);
            }
            RingChange::RemoveShard(shard_id) => {
                if !ring.contains_shard(shard_id) {
                    return Err(Error::ShardNotFound(shard_id));
                }
                if ring.len() == 1 {
                    return Err(Error::bad_request("cannot remove the last shard from the hash ring"));
                }
                ring.remove_shard(shard_id);
            }
        }
        self.new = Some(VersionedRing::new(self.old.version + 1, ring));
        Ok(())
    }

    /// Point reads at the new ring.
    pub fn commit_read(&mut self) -> Result<()> {
        let new = self.resharding_ring()?.clone();
        self.read = new;
        Ok(())
    }

    /// Point writes at the new ring.
    pub fn commit_write(&mut self) -> Result<()> {
        let new = self.resharding_ring()?.clone();
        self.write = new;
        Ok(())
    }

    /// Make the new ring the only ring.
    pub fn finish(&mut self) -> Result<()> {
        let new = self.resharding_ring()?.clone();
        self.old = new.clone();
        self.read = new.clone();
        self.write = new;
        self.new = None;
        Ok(())
    }

    /// Drop the new ring and route everything by the old ring again.
    pub fn abort(&mut self) {
        self.new = None;
        self.read = self.old.clone();
        self.write = self.old.clone();
    }

    /// Filter selecting points that the larger of the old and new rings assigns to `shard_id`.
    ///
    /// For a split this is the new ring, for a merge the old ring, so the filter
    /// always names the points belonging to the shard being added or removed.
    pub fn filter(&self, shard_id: ShardId) -> HashRingFilter {
        let ring = match &self.new {
            Some(new) if new.ring.len() > self.old.ring.len() => &new.ring,
            _ => &self.old.ring,
        };
        HashRingFilter::new(ring.clone(), shard_id)
    }

    /// Filter selecting points the target ring assigns to `shard_id`.
    pub fn new_ring_filter(&self, shard_id: ShardId) -> HashRingFilter {
        HashRingFilter::new(self.target().ring.clone(), shard_id)
    }

    fn resharding_ring(&self) -> Result<&VersionedRing> {
        self.new
            .as_ref()
            .ok_or_else(|| Error::Internal("hash ring is not resharding".into()))
    }
}

/// Predicate selecting points a ring routes to an expected shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRingFilter {
    ring: HashRing,
    expected_shard_id: ShardId,
}

impl HashRingFilter {
    pub fn new(ring: HashRing, expected_shard_id: ShardId) -> Self {
        Self {
            ring,
            expected_shard_id,
        }
    }

    pub fn expected_shard_id(&self) -> ShardId {
        self.expected_shard_id
    }

    /// Whether the point belongs to the expected shard.
    pub fn check(&self, point_id: &PointId) -> bool {
        self.ring.route(point_id) == Some(self.expected_shard_id)
    }
}
