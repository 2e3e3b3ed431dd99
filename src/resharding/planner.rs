//! Turns an operator request into a concrete, replayable resharding plan.
//!
//! Planning reads the current metadata and makes every choice up front: the
//! shard to add or remove, the peer, the transfer sources. The plan is stored in
//! the metadata log entry, so applying it never depends on anything but the
//! entry and the state it is applied to.

use super::operation::{ReshardStage, ReshardingOperation, ReshardingRequest};
use super::metadata::ClusterMetadata;
use super::transfer::{suggest_transfer_source, ShardTransfer, TransferKey, TransferMethod, TransferStatus};
use crate::config::ShardSelectionPolicy;
use crate::consensus::Placement;
use crate::error::{Error, Result};
use crate::types::{PeerId, ReplicaState, ReshardingDirection, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// Operation record plus the transfers that populate its target replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardingPlan {
    pub operation: ReshardingOperation,
    pub transfers: Vec<ShardTransfer>,
}

/// Plan a resharding operation against the current metadata.
pub fn plan_resharding(
    meta: &ClusterMetadata,
    collection: &str,
    request: &ReshardingRequest,
    policy: ShardSelectionPolicy,
) -> Result<ReshardingPlan> {
    let collection_meta = meta.collection(collection)?;
    if let Some(operation) = meta.operation(collection) {
        return Err(Error::OperationInProgress {
            collection: collection.to_string(),
            operation: operation.describe(),
        });
    }
    if let Some(transfer) = collection_meta.transfers().first() {
        return Err(Error::TransferConflict(format!(
            "collection {} has transfer {} in flight",
            collection, transfer.key
        )));
    }
    let router = collection_meta.router(request.shard_key.as_ref())?;
    let group_shards = router.shards();

    let (shard_id, peer_id, transfers) = match request.direction {
        ReshardingDirection::Up => {
            let shard_id = match request.shard_id {
                Some(shard_id) if collection_meta.shard_ids().contains(&shard_id) => {
                    return Err(Error::bad_request(format!(
                        "shard {} already exists in collection {}",
                        shard_id, collection
                    )));
                }
                Some(shard_id) => shard_id,
                None => next_shard_id(&collection_meta.shard_ids()),
            };
            let peer_id = match request.peer_id {
                Some(peer_id) if !meta.peers().contains(&peer_id) => return Err(Error::PeerNotFound(peer_id)),
                Some(peer_id) => peer_id,
                None => least_loaded_peer(meta, collection)
                    .ok_or_else(|| Error::bad_request("cluster has no peers"))?,
            };

            let mut keys: Vec<TransferKey> = Vec::with_capacity(group_shards.len());
            for &source_shard in &group_shards {
                let replicas = meta.registry().shard_replicas(collection, source_shard)?;
                let from = suggest_transfer_source(&replicas, keys.iter())
                    .ok_or_else(|| no_active_replica(source_shard))?;
                keys.push(TransferKey {
                    shard_id: source_shard,
                    to_shard_id: shard_id,
                    from,
                    to: peer_id,
                });
            }
            (shard_id, peer_id, keys)
        }
        ReshardingDirection::Down => {
            if group_shards.len() <= 1 {
                return Err(Error::bad_request(format!(
                    "cannot remove the last shard of collection {}",
                    collection
                )));
            }
            let shard_id = match request.shard_id {
                Some(shard_id) if !group_shards.contains(&shard_id) => return Err(Error::ShardNotFound(shard_id)),
                Some(shard_id) => shard_id,
                None => select_shard(&group_shards, policy)?,
            };
            let replicas = meta.registry().shard_replicas(collection, shard_id)?;
            let from = match request.peer_id {
                Some(peer_id) if !meta.peers().contains(&peer_id) => return Err(Error::PeerNotFound(peer_id)),
                Some(peer_id) => {
                    let state = meta.registry().state(collection, shard_id, peer_id)?;
                    if state != ReplicaState::Active {
                        return Err(Error::bad_request(format!(
                            "replica of shard {} on peer {} is {}, not active",
                            shard_id, peer_id, state
                        )));
                    }
                    peer_id
                }
                None => suggest_transfer_source(&replicas, [].iter()).ok_or_else(|| no_active_replica(shard_id))?,
            };

            let mut keys = Vec::new();
            for &to_shard_id in group_shards.iter().filter(|&&id| id != shard_id) {
                let receivers: Vec<PeerId> = meta
                    .registry()
                    .shard_replicas(collection, to_shard_id)?
                    .into_iter()
                    .filter(|replica| replica.state == ReplicaState::Active)
                    .map(|replica| replica.peer_id)
                    .collect();
                if receivers.is_empty() {
                    return Err(no_active_replica(to_shard_id));
                }
                keys.extend(receivers.into_iter().map(|to| TransferKey {
                    shard_id,
                    to_shard_id,
                    from,
                    to,
                }));
            }
            (shard_id, from, keys)
        }
    };

    Ok(ReshardingPlan {
        operation: ReshardingOperation {
            collection_id: collection.to_string(),
            direction: request.direction,
            peer_id,
            shard_id,
            shard_key: request.shard_key.clone(),
            stage: ReshardStage::Starting,
            created_at: SystemTime::now(),
        },
        transfers: schedule(transfers),
    })
}

/// One running transfer per destination replica; the rest wait.
fn schedule(keys: Vec<TransferKey>) -> Vec<ShardTransfer> {
    let mut busy = BTreeSet::new();
    keys.into_iter()
        .map(|key| {
            let mut transfer = ShardTransfer::new(key, TransferMethod::ReshardingStreamRecords);
            if busy.insert(key.destination()) {
                transfer.status = TransferStatus::Running;
            }
            transfer
        })
        .collect()
}

fn next_shard_id(existing: &BTreeSet<ShardId>) -> ShardId {
    existing.last().map(|&max| max + 1).unwrap_or(0)
}

fn select_shard(shards: &[ShardId], policy: ShardSelectionPolicy) -> Result<ShardId> {
    let selected = match policy {
        ShardSelectionPolicy::Last => shards.iter().max(),
        ShardSelectionPolicy::First => shards.iter().min(),
    };
    selected
        .copied()
        .ok_or_else(|| Error::bad_request("shard group is empty"))
}

fn no_active_replica(shard_id: ShardId) -> Error {
    Error::bad_request(format!("shard {} has no active replica", shard_id))
}

/// Peer hosting the fewest replicas of the collection, lowest id on ties.
pub fn least_loaded_peer(meta: &ClusterMetadata, collection: &str) -> Option<PeerId> {
    meta.peers()
        .iter()
        .map(|&peer_id| (meta.registry().replica_count_on(collection, peer_id), peer_id))
        .min()
        .map(|(_, peer_id)| peer_id)
}

/// Round-robin placement: replica `j` of shard `i` goes to `peers[(i + j) % n]`.
pub fn place_shards(
    shard_ids: impl IntoIterator<Item = ShardId>,
    peers: &[PeerId],
    replication_factor: u32,
) -> Result<Placement> {
    if peers.is_empty() {
        return Err(Error::bad_request("cluster has no peers"));
    }
    let replication_factor = replication_factor as usize;
    if replication_factor == 0 || replication_factor > peers.len() {
        return Err(Error::bad_request(format!(
            "replication factor {} is not satisfiable with {} peers",
            replication_factor,
            peers.len()
        )));
    }
    Ok(shard_ids
        .into_iter()
        .map(|shard_id| {
            let hosts = (0..replication_factor)
                .map(|j| peers[(shard_id as usize + j) % peers.len()])
                .collect();
            (shard_id, hosts)
        })
        .collect())
}
