//! Resharding operation record and request.

use crate::types::{CollectionId, PeerId, ReshardingDirection, ShardId, ShardKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Stage of a live resharding operation. Idle is represented by the absence of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReshardStage {
    /// Target replicas created, transfers running.
    Starting,
    /// All transfers finished; waiting for the operator to commit the read ring.
    AwaitingReadCommit,
    /// Reads use the new ring; waiting for the write ring commit.
    AwaitingWriteCommit,
    /// Both rings committed; waiting for finish.
    AwaitingFinish,
}

impl ReshardStage {
    /// Whether the read ring already points at the new ring.
    pub fn read_committed(&self) -> bool {
        matches!(
            self,
            ReshardStage::AwaitingWriteCommit | ReshardStage::AwaitingFinish
        )
    }
}

impl fmt::Display for ReshardStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReshardStage::Starting => write!(f, "starting"),
            ReshardStage::AwaitingReadCommit => write!(f, "awaiting_read_commit"),
            ReshardStage::AwaitingWriteCommit => write!(f, "awaiting_write_commit"),
            ReshardStage::AwaitingFinish => write!(f, "awaiting_finish"),
        }
    }
}

/// The single live resharding operation of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardingOperation {
    pub collection_id: CollectionId,
    pub direction: ReshardingDirection,
    /// Peer hosting the new shard (up) or the source replica of the removed shard (down).
    pub peer_id: PeerId,
    /// Shard being added (up) or removed (down).
    pub shard_id: ShardId,
    pub shard_key: Option<ShardKey>,
    pub stage: ReshardStage,
    pub created_at: SystemTime,
}

impl ReshardingOperation {
    /// Human readable summary, used in cluster info comments and logs.
    pub fn describe(&self) -> String {
        let action = match self.direction {
            ReshardingDirection::Up => "adding",
            ReshardingDirection::Down => "removing",
        };
        match &self.shard_key {
            Some(key) => format!(
                "resharding {}: {} shard {} (key {}) on peer {}",
                self.direction, action, self.shard_id, key, self.peer_id
            ),
            None => format!(
                "resharding {}: {} shard {} on peer {}",
                self.direction, action, self.shard_id, self.peer_id
            ),
        }
    }

    /// `"<stage>: <description>"`.
    pub fn comment(&self) -> String {
        format!("{}: {}", self.stage, self.describe())
    }

    /// Whether the operation touches the given peer.
    pub fn involves_peer(&self, peer_id: PeerId) -> bool {
        self.peer_id == peer_id
    }
}

/// Operator request to start resharding a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshardingRequest {
    pub direction: ReshardingDirection,
    pub peer_id: Option<PeerId>,
    pub shard_key: Option<ShardKey>,
    pub shard_id: Option<ShardId>,
}

impl ReshardingRequest {
    pub fn new(direction: ReshardingDirection) -> Self {
        Self {
            direction,
            peer_id: None,
            shard_key: None,
            shard_id: None,
        }
    }

    /// Request adding one shard.
    pub fn up() -> Self {
        Self::new(ReshardingDirection::Up)
    }

    /// Request removing one shard.
    pub fn down() -> Self {
        Self::new(ReshardingDirection::Down)
    }

    pub fn with_peer(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn with_shard_key(mut self, shard_key: impl Into<ShardKey>) -> Self {
        self.shard_key = Some(shard_key.into());
        self
    }

    pub fn with_shard_id(mut self, shard_id: ShardId) -> Self {
        self.shard_id = Some(shard_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(stage: ReshardStage) -> ReshardingOperation {
        ReshardingOperation {
            collection_id: "test".into(),
            direction: ReshardingDirection::Up,
            peer_id: 2,
            shard_id: 3,
            shard_key: None,
            stage,
            created_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_comment() {
        let op = operation(ReshardStage::Starting);
        assert_eq!(op.comment(), "starting: resharding up: adding shard 3 on peer 2");

        let op = ReshardingOperation {
            shard_key: Some("tenant".into()),
            direction: ReshardingDirection::Down,
            ..operation(ReshardStage::AwaitingFinish)
        };
        assert_eq!(
            op.comment(),
            "awaiting_finish: resharding down: removing shard 3 (key tenant) on peer 2"
        );
    }

    #[test]
    fn test_read_committed() {
        assert!(!ReshardStage::Starting.read_committed());
        assert!(!ReshardStage::AwaitingReadCommit.read_committed());
        assert!(ReshardStage::AwaitingWriteCommit.read_committed());
        assert!(ReshardStage::AwaitingFinish.read_committed());
    }

    #[test]
    fn test_request_builder() {
        let request = ReshardingRequest::down().with_peer(1).with_shard_key("k").with_shard_id(2);
        assert_eq!(request.direction, ReshardingDirection::Down);
        assert_eq!(request.peer_id, Some(1));
        assert_eq!(request.shard_key, Some(ShardKey::from("k")));
        assert_eq!(request.shard_id, Some(2));
    }
}
