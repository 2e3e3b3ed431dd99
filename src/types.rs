//! Core types used throughout the resharding orchestrator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Peer identifier in the cluster.
pub type PeerId = u64;

/// Shard identifier, unique within a collection.
pub type ShardId = u32;

/// Collection name.
pub type CollectionId = String;

/// Stable identifier of a point. Reapplying a point with the same id is an overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PointId {
    /// Numeric id.
    Num(u64),
    /// UUID id.
    Uuid(Uuid),
}

impl PointId {
    /// Bytes fed into the hash ring for this point.
    pub fn routing_bytes(&self) -> Vec<u8> {
        match self {
            PointId::Num(n) => n.to_le_bytes().to_vec(),
            PointId::Uuid(u) => u.as_bytes().to_vec(),
        }
    }
}

impl From<u64> for PointId {
    fn from(id: u64) -> Self {
        PointId::Num(id)
    }
}

impl From<Uuid> for PointId {
    fn from(id: Uuid) -> Self {
        PointId::Uuid(id)
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointId::Num(n) => write!(f, "{}", n),
            PointId::Uuid(u) => write!(f, "{}", u),
        }
    }
}

/// Shard key of a custom-sharded collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardKey {
    Keyword(String),
    Number(u64),
}

impl From<&str> for ShardKey {
    fn from(key: &str) -> Self {
        ShardKey::Keyword(key.to_string())
    }
}

impl From<String> for ShardKey {
    fn from(key: String) -> Self {
        ShardKey::Keyword(key)
    }
}

impl From<u64> for ShardKey {
    fn from(key: u64) -> Self {
        ShardKey::Number(key)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Keyword(k) => write!(f, "{}", k),
            ShardKey::Number(n) => write!(f, "{}", n),
        }
    }
}

/// A stored point: id plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub id: PointId,
    pub payload: Bytes,
}

impl Point {
    /// Create a new point.
    pub fn new(id: impl Into<PointId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// Lifecycle state of a single shard replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Replica is serving reads and writes.
    Active,
    /// Replica failed and is excluded from routing.
    Dead,
    /// Replica is receiving a plain shard transfer.
    Partial,
    /// Replica is receiving or serving data for a resharding operation.
    Resharding,
}

impl ReplicaState {
    /// Whether reads may be served from a replica in this state.
    pub fn is_readable(&self) -> bool {
        matches!(self, ReplicaState::Active | ReplicaState::Resharding)
    }

    /// Whether writes should be delivered to a replica in this state.
    pub fn accepts_writes(&self) -> bool {
        !matches!(self, ReplicaState::Dead)
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::Dead => write!(f, "dead"),
            ReplicaState::Partial => write!(f, "partial"),
            ReplicaState::Resharding => write!(f, "resharding"),
        }
    }
}

/// Direction of a resharding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReshardingDirection {
    /// Add one shard.
    Up,
    /// Remove one shard.
    Down,
}

impl fmt::Display for ReshardingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReshardingDirection::Up => write!(f, "up"),
            ReshardingDirection::Down => write!(f, "down"),
        }
    }
}

/// How points of a collection are assigned to shard groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShardingMethod {
    /// One shard group, every point is routed by the hash ring.
    #[default]
    Auto,
    /// Points carry a shard key that selects the shard group.
    Custom,
}

/// Collection creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Number of shards (per shard key for custom sharding).
    pub shard_number: u32,
    /// Number of replicas per shard.
    pub replication_factor: u32,
    /// Sharding method.
    pub sharding_method: ShardingMethod,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            shard_number: 1,
            replication_factor: 1,
            sharding_method: ShardingMethod::Auto,
        }
    }
}

impl CollectionConfig {
    /// Create a config with the given shard count and replication factor.
    pub fn new(shard_number: u32, replication_factor: u32) -> Self {
        Self {
            shard_number,
            replication_factor,
            ..Default::default()
        }
    }

    /// Use custom sharding.
    pub fn with_custom_sharding(mut self) -> Self {
        self.sharding_method = ShardingMethod::Custom;
        self
    }
}
