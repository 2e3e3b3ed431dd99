//! Cluster metadata and the deterministic apply of metadata operations.
//!
//! [`ClusterMetadata`] is the replicated state: peers, collections with their
//! shard groups and hash-ring routers, the replica registry, in-flight
//! transfers and the keyed table of live resharding operations. It is only
//! changed by [`ClusterMetadata::apply`], which takes one committed
//! [`MetaOperation`] and returns the [`Effects`] the coordinator must carry out
//! on point data and transfer tasks.
//!
//! Apply is a pure function of the current state and the entry. A failed apply
//! leaves no trace because the coordinator applies to a staged copy first.

use super::operation::{ReshardStage, ReshardingOperation};
use super::planner::ReshardingPlan;
use super::registry::{ShardReplica, ShardReplicaRegistry};
use super::state_machine::{ReshardAction, ReshardingStateMachine};
use super::transfer::{check_transfer_conflicts, ShardTransfer, TransferKey, TransferMethod, TransferStatus};
use super::transfer_engine::TransferRequest;
use crate::cluster::{ClusterEventBridge, TopologyEvent};
use crate::consensus::{MetaOperation, Placement};
use crate::error::{Error, Result};
use crate::partitioning::{HashRing, HashRingFilter, HashRingRouter, RingChange};
use crate::storage::ShardLocation;
use crate::types::{
    CollectionConfig, CollectionId, PeerId, ReplicaState, ReshardingDirection, ShardId, ShardKey,
    ShardingMethod,
};
use std::collections::{BTreeMap, BTreeSet};

/// Point data work to run once an entry is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataCleanup {
    /// Drop every point of the replica.
    DropReplica(ShardLocation),
    /// Delete the points the filter selects from the replica.
    DeleteMatching(ShardLocation, HashRingFilter),
}

/// A resharding operation that ended in abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedOperation {
    pub operation: ReshardingOperation,
    pub forced: bool,
    pub reason: String,
}

/// Side effects of an applied entry.
///
/// Executed in field order: cancel, cleanup, spawn, then events.
#[derive(Debug, Default)]
pub struct Effects {
    pub cancel: Vec<(CollectionId, TransferKey)>,
    pub cleanup: Vec<DataCleanup>,
    pub spawn: Vec<TransferRequest>,
    pub events: Vec<TopologyEvent>,
    pub started: Vec<ReshardingOperation>,
    pub finished: Vec<ReshardingOperation>,
    pub aborted: Vec<AbortedOperation>,
    /// Transfers that left the table, with their final status.
    pub completed_transfers: Vec<(CollectionId, ShardTransfer)>,
}

/// Metadata of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMeta {
    pub config: CollectionConfig,
    /// Shard groups. Auto-sharded collections have the single group `None`.
    groups: BTreeMap<Option<ShardKey>, HashRingRouter>,
    transfers: Vec<ShardTransfer>,
}

impl CollectionMeta {
    fn new(config: CollectionConfig) -> Self {
        Self {
            config,
            groups: BTreeMap::new(),
            transfers: Vec::new(),
        }
    }

    pub fn transfers(&self) -> &[ShardTransfer] {
        &self.transfers
    }

    pub fn shard_keys(&self) -> Vec<ShardKey> {
        self.groups.keys().flatten().cloned().collect()
    }

    /// Every shard id of every group, including shards known to only one ring.
    pub fn shard_ids(&self) -> BTreeSet<ShardId> {
        self.groups.values().flat_map(|router| router.shards()).collect()
    }

    /// Shard key of the group holding the shard.
    pub fn shard_key_of(&self, shard_id: ShardId) -> Option<ShardKey> {
        self.groups
            .iter()
            .find(|(_, router)| router.shards().contains(&shard_id))
            .and_then(|(key, _)| key.clone())
    }

    /// Router of a shard group.
    ///
    /// Auto-sharded collections take no shard key, custom-sharded ones require one.
    pub fn router(&self, shard_key: Option<&ShardKey>) -> Result<&HashRingRouter> {
        self.check_shard_key(shard_key)?;
        self.groups
            .get(&shard_key.cloned())
            .ok_or_else(|| Self::group_not_found(shard_key))
    }

    fn router_mut(&mut self, shard_key: Option<&ShardKey>) -> Result<&mut HashRingRouter> {
        self.check_shard_key(shard_key)?;
        self.groups
            .get_mut(&shard_key.cloned())
            .ok_or_else(|| Self::group_not_found(shard_key))
    }

    fn check_shard_key(&self, shard_key: Option<&ShardKey>) -> Result<()> {
        match (self.config.sharding_method, shard_key) {
            (ShardingMethod::Auto, Some(key)) => Err(Error::bad_request(format!(
                "shard key {} given for an auto-sharded collection",
                key
            ))),
            (ShardingMethod::Custom, None) => {
                Err(Error::bad_request("shard key required for a custom-sharded collection"))
            }
            _ => Ok(()),
        }
    }

    fn group_not_found(shard_key: Option<&ShardKey>) -> Error {
        match shard_key {
            Some(key) => Error::ShardKeyNotFound(key.clone()),
            None => Error::Internal("auto-sharded collection has no shard group".into()),
        }
    }

    fn take_transfers(&mut self, mut pred: impl FnMut(&ShardTransfer) -> bool) -> Vec<ShardTransfer> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.transfers)
            .into_iter()
            .partition(|transfer| pred(transfer));
        self.transfers = kept;
        taken
    }
}

/// Replicated cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMetadata {
    peers: BTreeSet<PeerId>,
    collections: BTreeMap<CollectionId, CollectionMeta>,
    registry: ShardReplicaRegistry,
    /// Live resharding operation per collection.
    operations: BTreeMap<CollectionId, ReshardingOperation>,
    /// Bumped by every entry that schedules transfers.
    transfer_epoch: u64,
    vnodes_per_shard: usize,
}

impl ClusterMetadata {
    pub fn new(this_peer_id: PeerId, vnodes_per_shard: usize) -> Self {
        Self {
            peers: BTreeSet::new(),
            collections: BTreeMap::new(),
            registry: ShardReplicaRegistry::new(this_peer_id),
            operations: BTreeMap::new(),
            transfer_epoch: 0,
            vnodes_per_shard,
        }
    }

    /// Rebuild metadata by applying committed entries in order.
    pub fn replay<'a>(
        this_peer_id: PeerId,
        vnodes_per_shard: usize,
        entries: impl IntoIterator<Item = &'a MetaOperation>,
    ) -> Result<Self> {
        let mut meta = Self::new(this_peer_id, vnodes_per_shard);
        for entry in entries {
            meta.apply(entry)?;
        }
        Ok(meta)
    }

    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    pub fn registry(&self) -> &ShardReplicaRegistry {
        &self.registry
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionMeta> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &CollectionId> {
        self.collections.keys()
    }

    pub fn operation(&self, collection: &str) -> Option<&ReshardingOperation> {
        self.operations.get(collection)
    }

    pub fn operations(&self) -> impl Iterator<Item = &ReshardingOperation> {
        self.operations.values()
    }

    /// In-flight transfers of a collection, empty for unknown collections.
    pub fn transfers(&self, collection: &str) -> &[ShardTransfer] {
        self.collections
            .get(collection)
            .map(|meta| meta.transfers())
            .unwrap_or(&[])
    }

    pub fn router(&self, collection: &str, shard_key: Option<&ShardKey>) -> Result<&HashRingRouter> {
        self.collection(collection)?.router(shard_key)
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionMeta> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Apply one committed entry.
    pub fn apply(&mut self, op: &MetaOperation) -> Result<Effects> {
        let mut effects = Effects::default();
        match op {
            MetaOperation::AddPeer { peer_id } => {
                if !self.peers.insert(*peer_id) {
                    return Err(Error::bad_request(format!("peer {} already exists", peer_id)));
                }
            }
            MetaOperation::RemovePeer { peer_id, force } => {
                self.remove_peer(*peer_id, *force, &mut effects)?
            }
            MetaOperation::CreateCollection {
                collection,
                config,
                placement,
            } => self.create_collection(collection, config, placement)?,
            MetaOperation::DeleteCollection { collection } => {
                self.delete_collection(collection, &mut effects)?
            }
            MetaOperation::CreateShardKey {
                collection,
                shard_key,
                placement,
            } => self.create_shard_key(collection, shard_key, placement)?,
            MetaOperation::DeleteShardKey {
                collection,
                shard_key,
            } => self.delete_shard_key(collection, shard_key, &mut effects)?,
            MetaOperation::StartResharding { plan } => self.start_resharding(plan, &mut effects)?,
            MetaOperation::CommitReadHashRing { collection } => {
                let shard_key = self.transition(collection, ReshardAction::CommitReadHashRing)?;
                self.collection_mut(collection)?
                    .router_mut(shard_key.as_ref())?
                    .commit_read()?;
            }
            MetaOperation::CommitWriteHashRing { collection } => {
                let shard_key = self.transition(collection, ReshardAction::CommitWriteHashRing)?;
                self.collection_mut(collection)?
                    .router_mut(shard_key.as_ref())?
                    .commit_write()?;
            }
            MetaOperation::FinishResharding { collection } => {
                self.finish_resharding(collection, &mut effects)?
            }
            MetaOperation::AbortResharding {
                collection,
                forced,
                reason,
            } => {
                self.collection(collection)?;
                let stage = self.operations.get(collection).map(|op| op.stage);
                ReshardingStateMachine::default().next(stage, ReshardAction::Abort { forced: *forced })?;
                self.abort_operation(collection, *forced, reason, &mut effects)?;
            }
            MetaOperation::StartTransfer {
                collection,
                transfer,
            } => self.start_transfer(collection, transfer, &mut effects)?,
            MetaOperation::FinishTransfer {
                collection,
                key,
                epoch,
            } => self.finish_transfer(collection, *key, *epoch, &mut effects)?,
            MetaOperation::FailTransfer {
                collection,
                key,
                epoch,
                reason,
            } => self.fail_transfer(collection, *key, *epoch, reason, &mut effects)?,
            MetaOperation::AbortTransfer { collection, key } => {
                self.abort_transfer(collection, *key, &mut effects)?
            }
            MetaOperation::DropReplica {
                collection,
                shard_id,
                peer_id,
            } => self.drop_replica(collection, *shard_id, *peer_id, &mut effects)?,
            MetaOperation::SetReplicaState {
                collection,
                shard_id,
                peer_id,
                state,
            } => {
                let current = self.registry.state(collection, *shard_id, *peer_id)?;
                if *state == ReplicaState::Resharding || current == ReplicaState::Resharding {
                    return Err(Error::bad_request(format!(
                        "replica of shard {} on peer {} is managed by resharding",
                        shard_id, peer_id
                    )));
                }
                self.check_replica_unused(collection, *shard_id, *peer_id)?;
                self.registry.set_state(collection, *shard_id, *peer_id, *state)?;
            }
        }
        Ok(effects)
    }

    /// Advance the stage of a live operation. Returns the operation's shard key.
    fn transition(&mut self, collection: &str, action: ReshardAction) -> Result<Option<ShardKey>> {
        self.collection(collection)?;
        let stage = self.operations.get(collection).map(|op| op.stage);
        let next = ReshardingStateMachine::default().next(stage, action)?;
        let operation = self
            .operations
            .get_mut(collection)
            .ok_or_else(|| Error::Internal(format!("no operation for collection {}", collection)))?;
        if let Some(next) = next {
            operation.stage = next;
        }
        Ok(operation.shard_key.clone())
    }

    fn check_placement(&self, placement: &Placement) -> Result<()> {
        for (shard_id, peers) in placement {
            if peers.is_empty() {
                return Err(Error::bad_request(format!("shard {} has no replicas", shard_id)));
            }
            if let Some(peer_id) = peers.iter().find(|peer_id| !self.peers.contains(peer_id)) {
                return Err(Error::PeerNotFound(*peer_id));
            }
        }
        Ok(())
    }

    fn insert_placement(&mut self, collection: &str, placement: &Placement) -> Result<()> {
        for (&shard_id, peers) in placement {
            for &peer_id in peers {
                self.registry
                    .insert(collection, shard_id, peer_id, ReplicaState::Active)?;
            }
        }
        Ok(())
    }

    fn create_collection(
        &mut self,
        collection: &str,
        config: &CollectionConfig,
        placement: &Placement,
    ) -> Result<()> {
        if self.collections.contains_key(collection) {
            return Err(Error::bad_request(format!("collection {} already exists", collection)));
        }
        if config.shard_number == 0 || config.replication_factor == 0 {
            return Err(Error::bad_request("shard number and replication factor must be positive"));
        }
        let mut meta = CollectionMeta::new(config.clone());
        match config.sharding_method {
            ShardingMethod::Auto => {
                if placement.is_empty() {
                    return Err(Error::bad_request("collection placement is empty"));
                }
                let ring = HashRing::from_shards(self.vnodes_per_shard, placement.keys().copied());
                meta.groups.insert(None, HashRingRouter::single(ring));
            }
            ShardingMethod::Custom => {
                if !placement.is_empty() {
                    return Err(Error::bad_request(
                        "custom-sharded collections get their shards from shard keys",
                    ));
                }
            }
        }
        self.check_placement(placement)?;
        self.registry.register_collection(collection);
        self.insert_placement(collection, placement)?;
        self.collections.insert(collection.to_string(), meta);
        Ok(())
    }

    fn delete_collection(&mut self, collection: &str, effects: &mut Effects) -> Result<()> {
        self.collection(collection)?;
        let event = TopologyEvent::CollectionDeleted {
            collection: collection.to_string(),
        };
        self.force_abort_affected(&event, effects)?;

        if let Some(meta) = self.collections.remove(collection) {
            effects.cancel.extend(
                meta.transfers
                    .iter()
                    .map(|transfer| (collection.to_string(), transfer.key)),
            );
        }
        for replica in self.registry.remove_collection(collection).unwrap_or_default() {
            effects.cleanup.push(drop_cleanup(collection, &replica));
        }
        effects.events.push(event);
        Ok(())
    }

    fn create_shard_key(&mut self, collection: &str, shard_key: &ShardKey, placement: &Placement) -> Result<()> {
        let meta = self.collection(collection)?;
        if meta.config.sharding_method != ShardingMethod::Custom {
            return Err(Error::bad_request(format!(
                "collection {} does not use custom sharding",
                collection
            )));
        }
        if meta.groups.contains_key(&Some(shard_key.clone())) {
            return Err(Error::bad_request(format!("shard key {} already exists", shard_key)));
        }
        if placement.is_empty() {
            return Err(Error::bad_request("shard key placement is empty"));
        }
        let existing = meta.shard_ids();
        if let Some(shard_id) = placement.keys().find(|shard_id| existing.contains(shard_id)) {
            return Err(Error::bad_request(format!("shard {} already exists", shard_id)));
        }
        self.check_placement(placement)?;
        self.insert_placement(collection, placement)?;

        let ring = HashRing::from_shards(self.vnodes_per_shard, placement.keys().copied());
        self.collection_mut(collection)?
            .groups
            .insert(Some(shard_key.clone()), HashRingRouter::single(ring));
        Ok(())
    }

    fn delete_shard_key(&mut self, collection: &str, shard_key: &ShardKey, effects: &mut Effects) -> Result<()> {
        let meta = self.collection(collection)?;
        if meta.config.sharding_method != ShardingMethod::Custom {
            return Err(Error::bad_request(format!(
                "collection {} does not use custom sharding",
                collection
            )));
        }
        if !meta.groups.contains_key(&Some(shard_key.clone())) {
            return Err(Error::ShardKeyNotFound(shard_key.clone()));
        }
        let event = TopologyEvent::ShardKeyDeleted {
            collection: collection.to_string(),
            shard_key: shard_key.clone(),
        };
        self.force_abort_affected(&event, effects)?;

        let meta = self.collection_mut(collection)?;
        let shards = meta
            .groups
            .remove(&Some(shard_key.clone()))
            .map(|router| router.shards())
            .unwrap_or_default();
        let cancelled = meta.take_transfers(|transfer| {
            shards.contains(&transfer.key.shard_id) || shards.contains(&transfer.key.to_shard_id)
        });
        effects.cancel.extend(
            cancelled
                .iter()
                .map(|transfer| (collection.to_string(), transfer.key)),
        );
        for shard_id in shards {
            for replica in self.registry.remove_shard(collection, shard_id)? {
                effects.cleanup.push(drop_cleanup(collection, &replica));
            }
        }
        effects.events.push(event);
        Ok(())
    }

    fn remove_peer(&mut self, peer_id: PeerId, force: bool, effects: &mut Effects) -> Result<()> {
        if !self.peers.contains(&peer_id) {
            return Err(Error::PeerNotFound(peer_id));
        }
        let hosted = self.registry.replicas_on_peer(peer_id);
        if !force && !hosted.is_empty() {
            return Err(Error::bad_request(format!(
                "peer {} still hosts {} replicas",
                peer_id,
                hosted.len()
            )));
        }
        let event = TopologyEvent::PeerRemoved { peer_id, force };
        self.force_abort_affected(&event, effects)?;

        // Plain transfers touching the peer: the partial copy on the other side goes too.
        let mut partial = Vec::new();
        for (collection, meta) in self.collections.iter_mut() {
            for transfer in meta.take_transfers(|transfer| transfer.key.involves_peer(peer_id)) {
                effects.cancel.push((collection.clone(), transfer.key));
                if transfer.key.to != peer_id {
                    partial.push((collection.clone(), transfer.key));
                }
            }
        }
        for (collection, key) in partial {
            self.registry.remove(&collection, key.to_shard_id, key.to)?;
            effects
                .cleanup
                .push(DataCleanup::DropReplica(ShardLocation::new(collection, key.to, key.to_shard_id)));
        }

        for (collection, replica) in self.registry.replicas_on_peer(peer_id) {
            self.registry.remove(&collection, replica.shard_id, peer_id)?;
            effects.cleanup.push(drop_cleanup(&collection, &replica));
        }
        self.peers.remove(&peer_id);
        effects.events.push(event);
        Ok(())
    }

    fn force_abort_affected(&mut self, event: &TopologyEvent, effects: &mut Effects) -> Result<()> {
        let reason = Error::TopologyConflict(event.describe()).to_string();
        for collection in ClusterEventBridge::affected_operations(self, event) {
            self.abort_operation(&collection, true, &reason, effects)?;
        }
        Ok(())
    }

    fn start_resharding(&mut self, plan: &ReshardingPlan, effects: &mut Effects) -> Result<()> {
        let operation = &plan.operation;
        let collection = operation.collection_id.as_str();
        if let Some(existing) = self.operations.get(collection) {
            return Err(Error::OperationInProgress {
                collection: collection.to_string(),
                operation: existing.describe(),
            });
        }
        ReshardingStateMachine::default().next(None, ReshardAction::Start)?;
        if !self.peers.contains(&operation.peer_id) {
            return Err(Error::PeerNotFound(operation.peer_id));
        }

        let change = match operation.direction {
            ReshardingDirection::Up => RingChange::AddShard(operation.shard_id),
            ReshardingDirection::Down => RingChange::RemoveShard(operation.shard_id),
        };
        let epoch = self.next_transfer_epoch();
        let meta = self.collection_mut(collection)?;
        if let Some(transfer) = meta.transfers.first() {
            return Err(Error::TransferConflict(format!(
                "collection {} has transfer {} in flight",
                collection, transfer.key
            )));
        }
        let router = meta.router_mut(operation.shard_key.as_ref())?;
        router.start_resharding(change)?;
        for transfer in plan.transfers.iter().filter(|t| t.status == TransferStatus::Running) {
            effects.spawn.push(TransferRequest {
                collection: collection.to_string(),
                key: transfer.key,
                epoch,
                filter: Some(router.new_ring_filter(transfer.key.to_shard_id)),
            });
        }
        meta.transfers.extend(plan.transfers.iter().map(|transfer| ShardTransfer {
            epoch,
            ..transfer.clone()
        }));

        match operation.direction {
            ReshardingDirection::Up => {
                self.registry.insert(
                    collection,
                    operation.shard_id,
                    operation.peer_id,
                    ReplicaState::Resharding,
                )?;
            }
            ReshardingDirection::Down => {
                for transfer in &plan.transfers {
                    let (shard_id, peer_id) = transfer.key.destination();
                    self.registry
                        .set_state(collection, shard_id, peer_id, ReplicaState::Resharding)?;
                }
            }
        }

        let mut operation = operation.clone();
        operation.stage = ReshardStage::Starting;
        self.operations.insert(collection.to_string(), operation.clone());
        if plan.transfers.is_empty() {
            self.transition(collection, ReshardAction::TransfersFinished)?;
        }
        effects.started.push(operation);
        Ok(())
    }

    fn finish_resharding(&mut self, collection: &str, effects: &mut Effects) -> Result<()> {
        self.transition(collection, ReshardAction::Finish)?;
        let operation = self
            .operations
            .remove(collection)
            .ok_or_else(|| Error::Internal(format!("no operation for collection {}", collection)))?;

        let router = self
            .collection_mut(collection)?
            .router_mut(operation.shard_key.as_ref())?;
        let group = router.shards();
        let moved = router.new_ring_filter(operation.shard_id);
        let sources = router.old_ring().ring.shards().to_vec();
        router.finish()?;

        self.restore_resharding_replicas(collection, &group)?;
        match operation.direction {
            ReshardingDirection::Up => {
                for shard_id in sources {
                    for replica in self.registry.shard_replicas(collection, shard_id)? {
                        effects.cleanup.push(DataCleanup::DeleteMatching(
                            location(collection, &replica),
                            moved.clone(),
                        ));
                    }
                }
            }
            ReshardingDirection::Down => {
                for replica in self.registry.remove_shard(collection, operation.shard_id)? {
                    effects.cleanup.push(drop_cleanup(collection, &replica));
                }
            }
        }
        effects.finished.push(operation);
        Ok(())
    }

    /// Roll back a live operation. Callers validate the transition.
    fn abort_operation(
        &mut self,
        collection: &str,
        forced: bool,
        reason: &str,
        effects: &mut Effects,
    ) -> Result<()> {
        let Some(operation) = self.operations.remove(collection) else {
            return Ok(());
        };
        let meta = self.collection_mut(collection)?;
        let cancelled = meta.take_transfers(ShardTransfer::is_resharding);
        effects.cancel.extend(
            cancelled
                .iter()
                .map(|transfer| (collection.to_string(), transfer.key)),
        );
        let router = meta.router_mut(operation.shard_key.as_ref())?;
        let group = router.shards();
        let removed = router.filter(operation.shard_id);
        router.abort();

        match operation.direction {
            ReshardingDirection::Up => {
                for replica in self.registry.remove_shard(collection, operation.shard_id)? {
                    effects.cleanup.push(drop_cleanup(collection, &replica));
                }
            }
            ReshardingDirection::Down => {
                for replica in self.restore_resharding_replicas(collection, &group)? {
                    effects.cleanup.push(DataCleanup::DeleteMatching(
                        location(collection, &replica),
                        removed.clone(),
                    ));
                }
            }
        }
        effects.aborted.push(AbortedOperation {
            operation,
            forced,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Return every `Resharding` replica of the given shards to `Active`.
    fn restore_resharding_replicas(&mut self, collection: &str, shards: &[ShardId]) -> Result<Vec<ShardReplica>> {
        let restored: Vec<ShardReplica> = self
            .registry
            .replicas(collection)?
            .into_iter()
            .filter(|replica| {
                replica.state == ReplicaState::Resharding && shards.contains(&replica.shard_id)
            })
            .collect();
        for replica in &restored {
            self.registry
                .set_state(collection, replica.shard_id, replica.peer_id, ReplicaState::Active)?;
        }
        Ok(restored)
    }

    fn start_transfer(&mut self, collection: &str, transfer: &ShardTransfer, effects: &mut Effects) -> Result<()> {
        let key = transfer.key;
        let meta = self.collection(collection)?;
        if let Some(operation) = self.operations.get(collection) {
            return Err(Error::OperationInProgress {
                collection: collection.to_string(),
                operation: operation.describe(),
            });
        }
        if transfer.method != TransferMethod::StreamRecords {
            return Err(Error::bad_request(format!(
                "{} transfers are scheduled by resharding",
                transfer.method
            )));
        }
        if key.shard_id != key.to_shard_id || key.from == key.to {
            return Err(Error::bad_request(format!("invalid replication {}", key)));
        }
        for peer_id in [key.from, key.to] {
            if !self.peers.contains(&peer_id) {
                return Err(Error::PeerNotFound(peer_id));
            }
        }
        let source_state = self.registry.state(collection, key.shard_id, key.from)?;
        if source_state != ReplicaState::Active {
            return Err(Error::bad_request(format!(
                "source replica of shard {} on peer {} is {}",
                key.shard_id, key.from, source_state
            )));
        }
        if self.registry.contains(collection, key.shard_id, key.to) {
            return Err(Error::bad_request(format!(
                "peer {} already hosts shard {}",
                key.to, key.shard_id
            )));
        }
        check_transfer_conflicts(&key, meta.transfers.iter())?;

        self.registry
            .insert(collection, key.shard_id, key.to, ReplicaState::Partial)?;
        let epoch = self.next_transfer_epoch();
        self.collection_mut(collection)?.transfers.push(ShardTransfer {
            status: TransferStatus::Running,
            epoch,
            ..transfer.clone()
        });
        effects.spawn.push(TransferRequest {
            collection: collection.to_string(),
            key,
            epoch,
            filter: None,
        });
        Ok(())
    }

    fn next_transfer_epoch(&mut self) -> u64 {
        self.transfer_epoch += 1;
        self.transfer_epoch
    }

    fn finish_transfer(&mut self, collection: &str, key: TransferKey, epoch: u64, effects: &mut Effects) -> Result<()> {
        let shard_key = self.operation(collection).and_then(|op| op.shard_key.clone());
        let meta = self.collection_mut(collection)?;
        let position = meta
            .transfers
            .iter()
            .position(|transfer| transfer.key == key)
            .ok_or_else(|| Error::TransferNotFound(key.to_string()))?;
        check_report_epoch(&meta.transfers[position], epoch)?;
        if meta.transfers[position].status != TransferStatus::Running {
            return Err(Error::bad_request(format!("transfer {} is not running", key)));
        }
        let mut transfer = meta.transfers.remove(position);
        transfer.status = TransferStatus::Finished;

        if transfer.is_resharding() {
            let queued = meta.transfers.iter().position(|t| {
                t.status == TransferStatus::Pending && t.key.destination() == key.destination()
            });
            if let Some(index) = queued {
                meta.transfers[index].status = TransferStatus::Running;
                let next = meta.transfers[index].clone();
                let filter = meta.router(shard_key.as_ref())?.new_ring_filter(next.key.to_shard_id);
                effects.spawn.push(TransferRequest {
                    collection: collection.to_string(),
                    key: next.key,
                    epoch: next.epoch,
                    filter: Some(filter),
                });
            }
            let remaining = meta.transfers.iter().any(ShardTransfer::is_resharding);
            let starting = self
                .operation(collection)
                .is_some_and(|op| op.stage == ReshardStage::Starting);
            if !remaining && starting {
                self.transition(collection, ReshardAction::TransfersFinished)?;
            }
        } else {
            self.registry
                .set_state(collection, key.to_shard_id, key.to, ReplicaState::Active)?;
        }
        effects.completed_transfers.push((collection.to_string(), transfer));
        Ok(())
    }

    fn fail_transfer(
        &mut self,
        collection: &str,
        key: TransferKey,
        epoch: u64,
        reason: &str,
        effects: &mut Effects,
    ) -> Result<()> {
        let meta = self.collection_mut(collection)?;
        let mut transfer = meta
            .transfers
            .iter()
            .find(|transfer| transfer.key == key)
            .cloned()
            .ok_or_else(|| Error::TransferNotFound(key.to_string()))?;
        check_report_epoch(&transfer, epoch)?;

        if transfer.is_resharding() {
            let reason = Error::TransferFailed(format!("{}: {}", key, reason)).to_string();
            self.abort_operation(collection, true, &reason, effects)?;
            // The reporting task is exiting on its own and must not be joined.
            effects.cancel.retain(|(c, k)| !(c == collection && *k == key));
        } else {
            meta.take_transfers(|t| t.key == key);
            self.registry.remove(collection, key.to_shard_id, key.to)?;
            effects
                .cleanup
                .push(DataCleanup::DropReplica(ShardLocation::new(collection, key.to, key.to_shard_id)));
        }
        transfer.status = TransferStatus::Failed;
        effects.completed_transfers.push((collection.to_string(), transfer));
        Ok(())
    }

    fn abort_transfer(&mut self, collection: &str, key: TransferKey, effects: &mut Effects) -> Result<()> {
        let meta = self.collection_mut(collection)?;
        let transfer = meta
            .transfers
            .iter()
            .find(|transfer| transfer.key == key)
            .ok_or_else(|| Error::TransferNotFound(key.to_string()))?;
        if transfer.is_resharding() {
            return Err(Error::bad_request(format!(
                "transfer {} belongs to a resharding operation, abort the operation instead",
                key
            )));
        }
        meta.take_transfers(|t| t.key == key);
        effects.cancel.push((collection.to_string(), key));
        self.registry.remove(collection, key.to_shard_id, key.to)?;
        effects
            .cleanup
            .push(DataCleanup::DropReplica(ShardLocation::new(collection, key.to, key.to_shard_id)));
        Ok(())
    }

    fn drop_replica(&mut self, collection: &str, shard_id: ShardId, peer_id: PeerId, effects: &mut Effects) -> Result<()> {
        self.check_replica_unused(collection, shard_id, peer_id)?;
        if self.registry.shard_replicas(collection, shard_id)?.len() == 1 {
            return Err(Error::bad_request(format!(
                "cannot drop the last replica of shard {}",
                shard_id
            )));
        }
        self.registry.remove(collection, shard_id, peer_id)?;
        effects
            .cleanup
            .push(DataCleanup::DropReplica(ShardLocation::new(collection, peer_id, shard_id)));
        Ok(())
    }

    /// Reject changes to a replica that the live operation or a transfer depends on.
    fn check_replica_unused(&self, collection: &str, shard_id: ShardId, peer_id: PeerId) -> Result<()> {
        let state = self.registry.state(collection, shard_id, peer_id)?;
        if let Some(operation) = self.operations.get(collection) {
            if state == ReplicaState::Resharding || operation.shard_id == shard_id {
                return Err(Error::bad_request(format!(
                    "replica of shard {} on peer {} is part of {}",
                    shard_id,
                    peer_id,
                    operation.describe()
                )));
            }
        }
        let busy = self.transfers(collection).iter().find(|transfer| {
            (transfer.key.shard_id == shard_id && transfer.key.from == peer_id)
                || transfer.key.destination() == (shard_id, peer_id)
        });
        if let Some(transfer) = busy {
            return Err(Error::TransferConflict(format!(
                "replica of shard {} on peer {} is used by transfer {}",
                shard_id, peer_id, transfer.key
            )));
        }
        Ok(())
    }
}

fn location(collection: &str, replica: &ShardReplica) -> ShardLocation {
    ShardLocation::new(collection, replica.peer_id, replica.shard_id)
}

/// A report for an earlier transfer with the same key must not touch this one.
fn check_report_epoch(transfer: &ShardTransfer, reported: u64) -> Result<()> {
    if transfer.epoch != reported {
        return Err(Error::StaleTransferReport {
            transfer: transfer.key.to_string(),
            reported,
            current: transfer.epoch,
        });
    }
    Ok(())
}

fn drop_cleanup(collection: &str, replica: &ShardReplica) -> DataCleanup {
    DataCleanup::DropReplica(location(collection, replica))
}
