//! Metadata operations and the ordered log that commits them.

use crate::error::{Error, Result};
use crate::resharding::{ReshardingPlan, ShardTransfer, TransferKey};
use crate::types::{CollectionConfig, CollectionId, PeerId, ReplicaState, ShardId, ShardKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of a committed log entry, starting at 1.
pub type CommitIndex = u64;

/// Replica placement of newly created shards: shard id to hosting peers.
pub type Placement = BTreeMap<ShardId, Vec<PeerId>>;

/// A cluster metadata mutation.
///
/// Every field needed to apply the operation is carried in the entry itself, so
/// replaying the log on a fresh metadata state reproduces the same result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaOperation {
    AddPeer {
        peer_id: PeerId,
    },
    RemovePeer {
        peer_id: PeerId,
        force: bool,
    },
    CreateCollection {
        collection: CollectionId,
        config: CollectionConfig,
        placement: Placement,
    },
    DeleteCollection {
        collection: CollectionId,
    },
    CreateShardKey {
        collection: CollectionId,
        shard_key: ShardKey,
        placement: Placement,
    },
    DeleteShardKey {
        collection: CollectionId,
        shard_key: ShardKey,
    },
    StartResharding {
        plan: ReshardingPlan,
    },
    CommitReadHashRing {
        collection: CollectionId,
    },
    CommitWriteHashRing {
        collection: CollectionId,
    },
    FinishResharding {
        collection: CollectionId,
    },
    AbortResharding {
        collection: CollectionId,
        forced: bool,
        reason: String,
    },
    StartTransfer {
        collection: CollectionId,
        transfer: ShardTransfer,
    },
    /// Reported by the transfer task; `epoch` is the one it was spawned with.
    FinishTransfer {
        collection: CollectionId,
        key: TransferKey,
        epoch: u64,
    },
    FailTransfer {
        collection: CollectionId,
        key: TransferKey,
        epoch: u64,
        reason: String,
    },
    AbortTransfer {
        collection: CollectionId,
        key: TransferKey,
    },
    DropReplica {
        collection: CollectionId,
        shard_id: ShardId,
        peer_id: PeerId,
    },
    SetReplicaState {
        collection: CollectionId,
        shard_id: ShardId,
        peer_id: PeerId,
        state: ReplicaState,
    },
}

impl MetaOperation {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddPeer { .. } => "add_peer",
            Self::RemovePeer { .. } => "remove_peer",
            Self::CreateCollection { .. } => "create_collection",
            Self::DeleteCollection { .. } => "delete_collection",
            Self::CreateShardKey { .. } => "create_shard_key",
            Self::DeleteShardKey { .. } => "delete_shard_key",
            Self::StartResharding { .. } => "start_resharding",
            Self::CommitReadHashRing { .. } => "commit_read_hash_ring",
            Self::CommitWriteHashRing { .. } => "commit_write_hash_ring",
            Self::FinishResharding { .. } => "finish_resharding",
            Self::AbortResharding { .. } => "abort_resharding",
            Self::StartTransfer { .. } => "start_transfer",
            Self::FinishTransfer { .. } => "finish_transfer",
            Self::FailTransfer { .. } => "fail_transfer",
            Self::AbortTransfer { .. } => "abort_transfer",
            Self::DropReplica { .. } => "drop_replica",
            Self::SetReplicaState { .. } => "set_replica_state",
        }
    }

    /// Collection the operation targets, if any.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::AddPeer { .. } | Self::RemovePeer { .. } => None,
            Self::StartResharding { plan } => Some(&plan.operation.collection_id),
            Self::CreateCollection { collection, .. }
            | Self::DeleteCollection { collection }
            | Self::CreateShardKey { collection, .. }
            | Self::DeleteShardKey { collection, .. }
            | Self::CommitReadHashRing { collection }
            | Self::CommitWriteHashRing { collection }
            | Self::FinishResharding { collection }
            | Self::AbortResharding { collection, .. }
            | Self::StartTransfer { collection, .. }
            | Self::FinishTransfer { collection, .. }
            | Self::FailTransfer { collection, .. }
            | Self::AbortTransfer { collection, .. }
            | Self::DropReplica { collection, .. }
            | Self::SetReplicaState { collection, .. } => Some(collection),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Ordered, durable commit of metadata operations.
///
/// An operation takes effect only after `append` returns. Entries are totally
/// ordered; the returned index reflects that order.
#[async_trait::async_trait]
pub trait MetadataLog: Send + Sync + std::fmt::Debug {
    /// Durably record an operation and return its commit index.
    async fn append(&self, op: &MetaOperation) -> Result<CommitIndex>;

    /// Every committed operation in commit order.
    fn entries(&self) -> Result<Vec<MetaOperation>>;

    /// Index of the last committed entry, 0 when empty.
    fn last_index(&self) -> CommitIndex;
}

/// Metadata log holding encoded entries in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetadataLog {
    entries: RwLock<Vec<Vec<u8>>>,
}

impl InMemoryMetadataLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one entry by commit index.
    pub fn entry(&self, index: CommitIndex) -> Result<MetaOperation> {
        let entries = self.entries.read();
        let position = index
            .checked_sub(1)
            .ok_or_else(|| Error::Internal("commit index starts at 1".into()))?;
        let data = entries
            .get(position as usize)
            .ok_or_else(|| Error::Internal(format!("no log entry at index {}", index)))?;
        MetaOperation::from_bytes(data)
    }
}

#[async_trait::async_trait]
impl MetadataLog for InMemoryMetadataLog {
    async fn append(&self, op: &MetaOperation) -> Result<CommitIndex> {
        let data = op.to_bytes()?;
        let mut entries = self.entries.write();
        entries.push(data);
        Ok(entries.len() as CommitIndex)
    }

    fn entries(&self) -> Result<Vec<MetaOperation>> {
        self.entries
            .read()
            .iter()
            .map(|data| MetaOperation::from_bytes(data))
            .collect()
    }

    fn last_index(&self) -> CommitIndex {
        self.entries.read().len() as CommitIndex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resharding::{TransferMethod, TransferStatus};

    #[tokio::test]
    async fn test_append_assigns_increasing_indexes() {
        let log = InMemoryMetadataLog::new();
        let first = log.append(&MetaOperation::AddPeer { peer_id: 1 }).await.unwrap();
        let second = log
            .append(&MetaOperation::DeleteCollection {
                collection: "c".into(),
            })
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(1).unwrap(), MetaOperation::AddPeer { peer_id: 1 });
        assert!(log.entry(0).is_err());
        assert!(log.entry(3).is_err());
    }

    #[tokio::test]
    async fn test_entries_decode_in_order() {
        let log = InMemoryMetadataLog::new();
        let ops = vec![
            MetaOperation::AddPeer { peer_id: 1 },
            MetaOperation::StartTransfer {
                collection: "c".into(),
                transfer: ShardTransfer {
                    key: TransferKey {
                        shard_id: 0,
                        to_shard_id: 0,
                        from: 1,
                        to: 2,
                    },
                    method: TransferMethod::StreamRecords,
                    status: TransferStatus::Running,
                    epoch: 4,
                },
            },
            MetaOperation::SetReplicaState {
                collection: "c".into(),
                shard_id: 0,
                peer_id: 2,
                state: ReplicaState::Dead,
            },
        ];
        for op in &ops {
            log.append(op).await.unwrap();
        }
        assert_eq!(log.entries().unwrap(), ops);
    }

    #[test]
    fn test_collection_and_name() {
        let op = MetaOperation::AbortResharding {
            collection: "c".into(),
            forced: true,
            reason: "peer removed".into(),
        };
        assert_eq!(op.collection(), Some("c"));
        assert_eq!(op.name(), "abort_resharding");
        assert_eq!(MetaOperation::AddPeer { peer_id: 1 }.collection(), None);
    }

    #[test]
    fn test_corrupt_entry_is_serialization_error() {
        let err = MetaOperation::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
