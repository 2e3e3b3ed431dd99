//! Shard transfer records and placement rules.

use super::registry::ShardReplica;
use crate::error::{Error, Result};
use crate::types::{PeerId, ReplicaState, ShardId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a transfer within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferKey {
    pub shard_id: ShardId,
    pub to_shard_id: ShardId,
    pub from: PeerId,
    pub to: PeerId,
}

impl TransferKey {
    pub fn involves_peer(&self, peer_id: PeerId) -> bool {
        self.from == peer_id || self.to == peer_id
    }

    /// Destination replica `(shard, peer)`.
    pub fn destination(&self) -> (ShardId, PeerId) {
        (self.to_shard_id, self.to)
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shard_id == self.to_shard_id {
            write!(f, "shard {} peer {} -> {}", self.shard_id, self.from, self.to)
        } else {
            write!(
                f,
                "shard {} -> {} peer {} -> {}",
                self.shard_id, self.to_shard_id, self.from, self.to
            )
        }
    }
}

/// How points are moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferMethod {
    /// Copy every point of the shard to a new replica.
    StreamRecords,
    /// Copy the points a hash-ring filter selects into another shard.
    ReshardingStreamRecords,
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMethod::StreamRecords => write!(f, "stream_records"),
            TransferMethod::ReshardingStreamRecords => write!(f, "resharding_stream_records"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Queued behind another transfer into the same destination replica.
    Pending,
    Running,
    Finished,
    Failed,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::Running => write!(f, "running"),
            TransferStatus::Finished => write!(f, "finished"),
            TransferStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A scheduled or running shard transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTransfer {
    pub key: TransferKey,
    pub method: TransferMethod,
    pub status: TransferStatus,
    /// Set by the metadata entry that scheduled the transfer. Reports carrying
    /// another epoch belong to an earlier transfer with the same key.
    pub epoch: u64,
}

impl ShardTransfer {
    pub fn new(key: TransferKey, method: TransferMethod) -> Self {
        Self {
            key,
            method,
            status: TransferStatus::Pending,
            epoch: 0,
        }
    }

    pub fn is_resharding(&self) -> bool {
        self.method == TransferMethod::ReshardingStreamRecords
    }
}

/// Reject a transfer that overlaps one already in flight.
///
/// Two transfers conflict when they move the same shard and share a peer.
pub fn check_transfer_conflicts<'a>(
    key: &TransferKey,
    existing: impl IntoIterator<Item = &'a ShardTransfer>,
) -> Result<()> {
    for other in existing {
        let o = &other.key;
        if o == key {
            return Err(Error::TransferConflict(format!("transfer {} already exists", key)));
        }
        let same_shard = o.shard_id == key.shard_id && o.to_shard_id == key.to_shard_id;
        let shares_peer = o.involves_peer(key.from) || o.involves_peer(key.to);
        if same_shard && shares_peer {
            return Err(Error::TransferConflict(format!(
                "transfer {} overlaps transfer {}",
                key, o
            )));
        }
    }
    Ok(())
}

/// Active replica with the fewest outgoing transfers, lowest peer id on ties.
pub fn suggest_transfer_source<'a>(
    replicas: &[ShardReplica],
    transfers: impl IntoIterator<Item = &'a TransferKey> + Clone,
) -> Option<PeerId> {
    replicas
        .iter()
        .filter(|replica| replica.state == ReplicaState::Active)
        .map(|replica| {
            let outgoing = transfers
                .clone()
                .into_iter()
                .filter(|key| key.from == replica.peer_id)
                .count();
            (outgoing, replica.peer_id)
        })
        .min()
        .map(|(_, peer_id)| peer_id)
}
