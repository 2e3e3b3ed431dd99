//! Point store trait and an in-memory implementation.

use crate::error::Result;
use crate::partitioning::HashRingFilter;
use crate::types::{CollectionId, PeerId, Point, PointId, ShardId};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;

/// Address of one shard replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardLocation {
    pub collection: CollectionId,
    pub peer_id: PeerId,
    pub shard_id: ShardId,
}

impl ShardLocation {
    pub fn new(collection: impl Into<CollectionId>, peer_id: PeerId, shard_id: ShardId) -> Self {
        Self {
            collection: collection.into(),
            peer_id,
            shard_id,
        }
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.collection, self.shard_id, self.peer_id)
    }
}

/// A page of points read in id order.
#[derive(Debug, Clone, Default)]
pub struct PointBatch {
    pub points: Vec<Point>,
    /// Id to resume after, `None` when the shard is exhausted.
    pub next_offset: Option<PointId>,
}

impl PointBatch {
    pub fn is_final(&self) -> bool {
        self.next_offset.is_none()
    }
}

/// Access to the point data of shard replicas across the cluster.
#[async_trait::async_trait]
pub trait PointStore: Send + Sync + fmt::Debug {
    /// Insert or overwrite points by id.
    async fn upsert(&self, location: &ShardLocation, points: Vec<Point>) -> Result<()>;

    /// Read up to `limit` points with id greater than `offset`, in id order.
    async fn fetch_batch(
        &self,
        location: &ShardLocation,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<PointBatch>;

    /// Read one point.
    async fn get(&self, location: &ShardLocation, point_id: &PointId) -> Result<Option<Point>>;

    /// All points of a replica, optionally restricted by a hash-ring filter.
    async fn scroll(
        &self,
        location: &ShardLocation,
        filter: Option<&HashRingFilter>,
    ) -> Result<Vec<Point>>;

    /// Number of points, optionally restricted by a hash-ring filter.
    async fn count(&self, location: &ShardLocation, filter: Option<&HashRingFilter>)
        -> Result<usize>;

    /// Delete points selected by the filter. Returns the number removed.
    async fn delete_matching(&self, location: &ShardLocation, filter: &HashRingFilter)
        -> Result<usize>;

    /// Drop all data of a replica.
    async fn drop_shard(&self, location: &ShardLocation) -> Result<()>;
}

/// Point store keeping every replica in memory.
#[derive(Debug, Default)]
pub struct InMemoryPointStore {
    shards: DashMap<ShardLocation, BTreeMap<PointId, Point>>,
}

impl InMemoryPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of replicas holding any data.
    pub fn replica_count(&self) -> usize {
        self.shards.iter().filter(|entry| !entry.value().is_empty()).count()
    }

    fn matches(filter: Option<&HashRingFilter>, point_id: &PointId) -> bool {
        filter.is_none_or(|f| f.check(point_id))
    }
}

#[async_trait::async_trait]
impl PointStore for InMemoryPointStore {
    async fn upsert(&self, location: &ShardLocation, points: Vec<Point>) -> Result<()> {
        let mut shard = self.shards.entry(location.clone()).or_default();
        for point in points {
            shard.insert(point.id, point);
        }
        Ok(())
    }

    async fn fetch_batch(
        &self,
        location: &ShardLocation,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<PointBatch> {
        let Some(shard) = self.shards.get(location) else {
            return Ok(PointBatch::default());
        };

        let range = match offset {
            Some(after) => shard.range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded)),
            None => shard.range(..),
        };
        let mut iter = range.map(|(_, point)| point.clone());
        let points: Vec<Point> = iter.by_ref().take(limit).collect();
        let has_more = iter.next().is_some();
        let next_offset = if has_more {
            points.last().map(|point| point.id)
        } else {
            None
        };

        Ok(PointBatch {
            points,
            next_offset,
        })
    }

    async fn get(&self, location: &ShardLocation, point_id: &PointId) -> Result<Option<Point>> {
        Ok(self
            .shards
            .get(location)
            .and_then(|shard| shard.get(point_id).cloned()))
    }

    async fn scroll(
        &self,
        location: &ShardLocation,
        filter: Option<&HashRingFilter>,
    ) -> Result<Vec<Point>> {
        Ok(self
            .shards
            .get(location)
            .map(|shard| {
                shard
                    .values()
                    .filter(|point| Self::matches(filter, &point.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(
        &self,
        location: &ShardLocation,
        filter: Option<&HashRingFilter>,
    ) -> Result<usize> {
        Ok(self
            .shards
            .get(location)
            .map(|shard| shard.keys().filter(|id| Self::matches(filter, id)).count())
            .unwrap_or(0))
    }

    async fn delete_matching(
        &self,
        location: &ShardLocation,
        filter: &HashRingFilter,
    ) -> Result<usize> {
        let Some(mut shard) = self.shards.get_mut(location) else {
            return Ok(0);
        };
        let before = shard.len();
        shard.retain(|id, _| !filter.check(id));
        Ok(before - shard.len())
    }

    async fn drop_shard(&self, location: &ShardLocation) -> Result<()> {
        self.shards.remove(location);
        Ok(())
    }
}
