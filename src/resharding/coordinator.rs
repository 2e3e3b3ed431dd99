//! Resharding coordinator: the control surface of the orchestrator.
//!
//! Every mutating request goes through the same commit path:
//!
//! ```text
//!   request ──▶ plan (under commit lock) ──▶ apply to staged copy
//!                                              │ rejected: nothing changes
//!                                              ▼
//!                                      MetadataLog::append
//!                                              │
//!                                              ▼
//!                                      publish staged metadata
//!                                              │
//!                                              ▼
//!        cancel transfers ─▶ data cleanup ─▶ spawn transfers ─▶ events
//! ```
//!
//! The commit lock gives all requests a total order. Of two racing `start`
//! calls the second is planned against the result of the first and fails with
//! `OperationInProgress`. Transfer tasks report back through the same path via
//! [`TransferReporter`]; their reports run as detached tasks, so cancelling a
//! transfer never tears a commit in half.

use super::metadata::{ClusterMetadata, DataCleanup, Effects};
use super::operation::{ReshardStage, ReshardingOperation, ReshardingRequest};
use super::planner::{place_shards, plan_resharding};
use super::registry::ShardReplica;
use super::state_machine::{ReshardAction, ReshardingStateMachine};
use super::transfer::{ShardTransfer, TransferKey, TransferMethod, TransferStatus};
use super::transfer_engine::{TransferEngine, TransferProgress, TransferReporter, TransferRequest};
use crate::cluster::{ClusterEventBridge, TopologyListener};
use crate::config::ReshardingConfig;
use crate::consensus::{InMemoryMetadataLog, MetaOperation, MetadataLog, Placement};
use crate::error::{Error, Result};
use crate::metrics::ReshardingMetrics;
use crate::partitioning::HashRingFilter;
use crate::storage::{PointStore, ShardLocation};
use crate::types::{
    CollectionConfig, PeerId, Point, PointId, ReplicaState, ReshardingDirection, ShardId, ShardKey,
    ShardingMethod,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Cluster view of one collection, as seen from this peer.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionClusterInfo {
    pub peer_id: PeerId,
    pub shard_count: usize,
    pub local_shards: Vec<LocalShardInfo>,
    pub remote_shards: Vec<RemoteShardInfo>,
    pub resharding_operations: Vec<ReshardingInfo>,
    pub shard_transfers: Vec<ShardTransferInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalShardInfo {
    pub shard_id: ShardId,
    pub shard_key: Option<ShardKey>,
    pub points_count: usize,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteShardInfo {
    pub shard_id: ShardId,
    pub shard_key: Option<ShardKey>,
    pub peer_id: PeerId,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReshardingInfo {
    pub direction: ReshardingDirection,
    pub shard_id: ShardId,
    pub peer_id: PeerId,
    pub shard_key: Option<ShardKey>,
    pub stage: ReshardStage,
    /// `"<stage>: <description>"`.
    pub comment: String,
}

impl From<&ReshardingOperation> for ReshardingInfo {
    fn from(operation: &ReshardingOperation) -> Self {
        Self {
            direction: operation.direction,
            shard_id: operation.shard_id,
            peer_id: operation.peer_id,
            shard_key: operation.shard_key.clone(),
            stage: operation.stage,
            comment: operation.comment(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardTransferInfo {
    pub shard_id: ShardId,
    pub to_shard_id: ShardId,
    pub from: PeerId,
    pub to: PeerId,
    pub method: TransferMethod,
    pub status: TransferStatus,
    /// Points applied so far, when the task runs on this process.
    pub points_transferred: Option<u64>,
}

/// Drives resharding operations and shard transfers for every collection.
pub struct ReshardingCoordinator {
    config: ReshardingConfig,
    /// Last committed metadata.
    metadata: RwLock<ClusterMetadata>,
    log: Arc<dyn MetadataLog>,
    /// Serializes plan, append and apply.
    commit_lock: tokio::sync::Mutex<()>,
    /// Writers hold it shared; publishing new metadata holds it exclusively.
    data_gate: tokio::sync::RwLock<()>,
    store: Arc<dyn PointStore>,
    engine: TransferEngine,
    bridge: ClusterEventBridge,
    metrics: Arc<ReshardingMetrics>,
    weak: Weak<Self>,
}

impl std::fmt::Debug for ReshardingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReshardingCoordinator")
            .field("peer_id", &self.config.this_peer_id)
            .field("log_index", &self.log.last_index())
            .field("engine", &self.engine)
            .finish()
    }
}

impl ReshardingCoordinator {
    /// Coordinator with an empty in-memory metadata log.
    pub fn new(config: ReshardingConfig, store: Arc<dyn PointStore>) -> Arc<Self> {
        let metadata = ClusterMetadata::new(config.this_peer_id, config.vnodes_per_shard);
        Self::build(config, store, Arc::new(InMemoryMetadataLog::new()), metadata)
    }

    /// Rebuild a coordinator from a metadata log and resume its running transfers.
    pub async fn recover(
        config: ReshardingConfig,
        store: Arc<dyn PointStore>,
        log: Arc<dyn MetadataLog>,
    ) -> Result<Arc<Self>> {
        let entries = log.entries()?;
        let metadata = ClusterMetadata::replay(config.this_peer_id, config.vnodes_per_shard, &entries)?;
        let coordinator = Self::build(config, store, log, metadata);

        let guard = coordinator.commit_lock.lock().await;
        let requests = coordinator.running_transfers()?;
        info!(
            entries = entries.len(),
            transfers = requests.len(),
            "Recovered cluster metadata from log"
        );
        for request in requests {
            coordinator.spawn_transfer(request);
        }
        drop(guard);
        Ok(coordinator)
    }

    fn build(
        config: ReshardingConfig,
        store: Arc<dyn PointStore>,
        log: Arc<dyn MetadataLog>,
        metadata: ClusterMetadata,
    ) -> Arc<Self> {
        let metrics = Arc::new(ReshardingMetrics::new());
        let engine = TransferEngine::new(store.clone(), config.transfer.clone(), metrics.clone());
        Arc::new_cyclic(|weak| Self {
            config,
            metadata: RwLock::new(metadata),
            log,
            commit_lock: tokio::sync::Mutex::new(()),
            data_gate: tokio::sync::RwLock::new(()),
            store,
            engine,
            bridge: ClusterEventBridge::new(),
            metrics,
            weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &ReshardingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ReshardingMetrics> {
        &self.metrics
    }

    /// Snapshot of the committed metadata.
    pub fn metadata(&self) -> ClusterMetadata {
        self.metadata.read().clone()
    }

    /// Subscribe to committed topology events.
    pub fn subscribe(&self, listener: Arc<dyn TopologyListener>) {
        self.bridge.subscribe(listener);
    }

    // ------------------------------------------------------------------
    // Resharding
    // ------------------------------------------------------------------

    /// Start resharding a collection up or down by one shard.
    pub async fn start_resharding(&self, collection: &str, request: ReshardingRequest) -> Result<()> {
        let policy = self.config.down_shard_policy;
        self.commit_with(|meta| {
            let plan = plan_resharding(meta, collection, &request, policy)?;
            Ok(MetaOperation::StartResharding { plan })
        })
        .await
    }

    /// Point reads at the new hash ring.
    pub async fn commit_read_hash_ring(&self, collection: &str) -> Result<()> {
        self.commit(MetaOperation::CommitReadHashRing {
            collection: collection.to_string(),
        })
        .await
    }

    /// Point writes at the new hash ring.
    pub async fn commit_write_hash_ring(&self, collection: &str) -> Result<()> {
        self.commit(MetaOperation::CommitWriteHashRing {
            collection: collection.to_string(),
        })
        .await
    }

    /// Promote the target replicas and retire data the new ring no longer owns.
    pub async fn finish_resharding(&self, collection: &str) -> Result<()> {
        self.commit(MetaOperation::FinishResharding {
            collection: collection.to_string(),
        })
        .await
    }

    /// Roll back the live operation of a collection.
    pub async fn abort_resharding(&self, collection: &str) -> Result<()> {
        let policy = ReshardingStateMachine::new(self.config.allow_abort_after_read_commit);
        self.commit_with(|meta| {
            meta.collection(collection)?;
            let stage = meta.operation(collection).map(|op| op.stage);
            policy.next(stage, ReshardAction::Abort { forced: false })?;
            Ok(MetaOperation::AbortResharding {
                collection: collection.to_string(),
                forced: false,
                reason: "aborted by request".to_string(),
            })
        })
        .await
    }

    /// The live resharding operation of a collection.
    pub fn resharding_operation(&self, collection: &str) -> Option<ReshardingOperation> {
        self.metadata.read().operation(collection).cloned()
    }

    // ------------------------------------------------------------------
    // Shard transfers and replicas
    // ------------------------------------------------------------------

    /// Copy a shard to a peer that does not host it yet.
    pub async fn replicate_shard(&self, collection: &str, key: TransferKey, method: TransferMethod) -> Result<()> {
        self.commit(MetaOperation::StartTransfer {
            collection: collection.to_string(),
            transfer: ShardTransfer::new(key, method),
        })
        .await
    }

    /// Cancel a plain transfer and drop its partial replica.
    pub async fn abort_transfer(&self, collection: &str, key: TransferKey) -> Result<()> {
        self.commit(MetaOperation::AbortTransfer {
            collection: collection.to_string(),
            key,
        })
        .await
    }

    pub fn transfer_progress(&self, collection: &str, key: TransferKey) -> Option<TransferProgress> {
        self.engine.progress(collection, key)
    }

    pub async fn drop_replica(&self, collection: &str, shard_id: ShardId, peer_id: PeerId) -> Result<()> {
        self.commit(MetaOperation::DropReplica {
            collection: collection.to_string(),
            shard_id,
            peer_id,
        })
        .await
    }

    pub async fn set_replica_state(
        &self,
        collection: &str,
        shard_id: ShardId,
        peer_id: PeerId,
        state: ReplicaState,
    ) -> Result<()> {
        self.commit(MetaOperation::SetReplicaState {
            collection: collection.to_string(),
            shard_id,
            peer_id,
            state,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    pub async fn add_peer(&self, peer_id: PeerId) -> Result<()> {
        self.commit(MetaOperation::AddPeer { peer_id }).await
    }

    /// Remove a peer. With `force` its replicas go with it and intersecting operations abort.
    pub async fn remove_peer(&self, peer_id: PeerId, force: bool) -> Result<()> {
        self.commit(MetaOperation::RemovePeer { peer_id, force }).await
    }

    /// Create a collection, placing replicas round-robin over the current peers.
    pub async fn create_collection(&self, collection: &str, config: CollectionConfig) -> Result<()> {
        self.commit_with(|meta| {
            let placement = match config.sharding_method {
                ShardingMethod::Auto => {
                    let peers: Vec<PeerId> = meta.peers().iter().copied().collect();
                    place_shards(0..config.shard_number, &peers, config.replication_factor)?
                }
                ShardingMethod::Custom => Placement::new(),
            };
            Ok(MetaOperation::CreateCollection {
                collection: collection.to_string(),
                config: config.clone(),
                placement,
            })
        })
        .await
    }

    pub async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.commit(MetaOperation::DeleteCollection {
            collection: collection.to_string(),
        })
        .await
    }

    /// Create a shard key group with the collection's shard number.
    pub async fn create_shard_key(&self, collection: &str, shard_key: impl Into<ShardKey>) -> Result<()> {
        let shard_key = shard_key.into();
        self.commit_with(|meta| {
            let collection_meta = meta.collection(collection)?;
            let first = collection_meta
                .shard_ids()
                .last()
                .map(|&max| max + 1)
                .unwrap_or(0);
            let config = &collection_meta.config;
            let peers: Vec<PeerId> = meta.peers().iter().copied().collect();
            let placement = place_shards(
                first..first + config.shard_number,
                &peers,
                config.replication_factor,
            )?;
            Ok(MetaOperation::CreateShardKey {
                collection: collection.to_string(),
                shard_key: shard_key.clone(),
                placement,
            })
        })
        .await
    }

    pub async fn delete_shard_key(&self, collection: &str, shard_key: impl Into<ShardKey>) -> Result<()> {
        self.commit(MetaOperation::DeleteShardKey {
            collection: collection.to_string(),
            shard_key: shard_key.into(),
        })
        .await
    }

    // ------------------------------------------------------------------
    // Points
    // ------------------------------------------------------------------

    /// Write points to every shard the write routing names, on every replica accepting writes.
    pub async fn upsert_points(
        &self,
        collection: &str,
        shard_key: Option<ShardKey>,
        points: Vec<Point>,
    ) -> Result<()> {
        let _gate = self.data_gate.read().await;
        let batches = {
            let meta = self.metadata.read();
            let router = meta.router(collection, shard_key.as_ref())?;
            let mut by_shard: BTreeMap<ShardId, Vec<Point>> = BTreeMap::new();
            for point in points {
                for shard_id in router.write_targets(&point.id) {
                    by_shard.entry(shard_id).or_default().push(point.clone());
                }
            }
            let mut batches = Vec::new();
            for (shard_id, points) in by_shard {
                for replica in meta.registry().shard_replicas(collection, shard_id)? {
                    if replica.state.accepts_writes() {
                        batches.push((location(collection, &replica), points.clone()));
                    }
                }
            }
            batches
        };
        for (location, points) in batches {
            self.store.upsert(&location, points).await?;
        }
        Ok(())
    }

    /// Read a point through the read ring.
    pub async fn get_point(
        &self,
        collection: &str,
        shard_key: Option<ShardKey>,
        point_id: PointId,
    ) -> Result<Option<Point>> {
        let replicas = {
            let meta = self.metadata.read();
            let router = meta.router(collection, shard_key.as_ref())?;
            let shard_id = router
                .route_read(&point_id)
                .ok_or_else(|| Error::Internal("hash ring is empty".into()))?;
            let mut replicas: Vec<ShardReplica> = meta
                .registry()
                .shard_replicas(collection, shard_id)?
                .into_iter()
                .filter(|replica| replica.state.is_readable())
                .collect();
            replicas.sort_by_key(|replica| replica.peer_id != self.config.this_peer_id);
            replicas
        };

        let mut last_error = None;
        for replica in replicas {
            match self.store.get(&location(collection, &replica), &point_id).await {
                Ok(point) => return Ok(point),
                Err(e) => {
                    debug!(collection, shard_id = replica.shard_id, peer_id = replica.peer_id, error = %e, "Replica read failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Err(Error::bad_request("no readable replica")),
        }
    }

    /// Points of one replica, optionally restricted by a hash-ring filter.
    pub async fn scroll_points(
        &self,
        collection: &str,
        peer_id: PeerId,
        shard_id: ShardId,
        filter: Option<&HashRingFilter>,
    ) -> Result<Vec<Point>> {
        self.metadata.read().registry().state(collection, shard_id, peer_id)?;
        self.store
            .scroll(&ShardLocation::new(collection, peer_id, shard_id), filter)
            .await
    }

    pub async fn count_points(
        &self,
        collection: &str,
        peer_id: PeerId,
        shard_id: ShardId,
        filter: Option<&HashRingFilter>,
    ) -> Result<usize> {
        self.metadata.read().registry().state(collection, shard_id, peer_id)?;
        self.store
            .count(&ShardLocation::new(collection, peer_id, shard_id), filter)
            .await
    }

    /// Filter selecting the points a shard gains or loses in the live operation.
    pub fn hash_ring_filter(
        &self,
        collection: &str,
        shard_key: Option<&ShardKey>,
        expected_shard_id: ShardId,
    ) -> Result<HashRingFilter> {
        let meta = self.metadata.read();
        let router = meta.router(collection, shard_key)?;
        if !router.shards().contains(&expected_shard_id) {
            return Err(Error::ShardNotFound(expected_shard_id));
        }
        Ok(router.filter(expected_shard_id))
    }

    // ------------------------------------------------------------------
    // Cluster info
    // ------------------------------------------------------------------

    pub async fn get_cluster_info(&self, collection: &str) -> Result<CollectionClusterInfo> {
        let (local, mut info) = {
            let meta = self.metadata.read();
            let collection_meta = meta.collection(collection)?;
            let snapshot = meta.registry().get(collection)?;
            let info = CollectionClusterInfo {
                peer_id: self.config.this_peer_id,
                shard_count: collection_meta.shard_ids().len(),
                local_shards: Vec::new(),
                remote_shards: snapshot
                    .remote_shards
                    .iter()
                    .map(|replica| RemoteShardInfo {
                        shard_id: replica.shard_id,
                        shard_key: collection_meta.shard_key_of(replica.shard_id),
                        peer_id: replica.peer_id,
                        state: replica.state,
                    })
                    .collect(),
                resharding_operations: meta
                    .operation(collection)
                    .map(ReshardingInfo::from)
                    .into_iter()
                    .collect(),
                shard_transfers: collection_meta
                    .transfers()
                    .iter()
                    .map(|transfer| ShardTransferInfo {
                        shard_id: transfer.key.shard_id,
                        to_shard_id: transfer.key.to_shard_id,
                        from: transfer.key.from,
                        to: transfer.key.to,
                        method: transfer.method,
                        status: transfer.status,
                        points_transferred: self
                            .engine
                            .progress(collection, transfer.key)
                            .map(|progress| progress.points_acked),
                    })
                    .collect(),
            };
            let local: Vec<(ShardReplica, Option<ShardKey>)> = snapshot
                .local_shards
                .iter()
                .map(|replica| (*replica, collection_meta.shard_key_of(replica.shard_id)))
                .collect();
            (local, info)
        };

        for (replica, shard_key) in local {
            let points_count = self
                .store
                .count(&location(collection, &replica), None)
                .await?;
            info.local_shards.push(LocalShardInfo {
                shard_id: replica.shard_id,
                shard_key,
                points_count,
                state: replica.state,
            });
        }
        Ok(info)
    }

    /// Cancel every running transfer task.
    pub async fn shutdown(&self) {
        let _guard = self.commit_lock.lock().await;
        self.engine.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Commit path
    // ------------------------------------------------------------------

    async fn commit(&self, op: MetaOperation) -> Result<()> {
        self.commit_with(move |_| Ok(op)).await
    }

    async fn commit_with<F>(&self, plan: F) -> Result<()>
    where
        F: FnOnce(&ClusterMetadata) -> Result<MetaOperation>,
    {
        self.commit_from(Origin::Request, plan).await
    }

    /// Plan an entry against the committed metadata, append it and apply it.
    async fn commit_from<F>(&self, origin: Origin, plan: F) -> Result<()>
    where
        F: FnOnce(&ClusterMetadata) -> Result<MetaOperation>,
    {
        let _guard = self.commit_lock.lock().await;

        let staged = {
            let meta = self.metadata.read();
            plan(&meta).and_then(|op| {
                let mut staged = meta.clone();
                let effects = staged.apply(&op)?;
                Ok((op, staged, effects))
            })
        };
        let (op, staged, effects) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                match origin {
                    Origin::Request => self.metrics.record_rejected(),
                    Origin::TransferReport => self.metrics.record_rejected_report(),
                }
                debug!(error = %e, status = e.status_code(), ?origin, "Metadata request rejected");
                return Err(e);
            }
        };

        let index = self.log.append(&op).await?;
        {
            let _gate = self.data_gate.write().await;
            *self.metadata.write() = staged;
        }
        debug!(index, op = op.name(), collection = ?op.collection(), "Metadata entry committed");

        self.execute(effects).await;
        Ok(())
    }

    /// Carry out the effects of a committed entry. Runs under the commit lock.
    async fn execute(&self, effects: Effects) {
        for (collection, key) in &effects.cancel {
            if self.engine.cancel(collection, *key).await {
                debug!(collection = %collection, transfer = %key, "Transfer cancelled");
            }
        }

        for cleanup in &effects.cleanup {
            let result = match cleanup {
                DataCleanup::DropReplica(location) => self.store.drop_shard(location).await.map(|_| 0),
                DataCleanup::DeleteMatching(location, filter) => {
                    self.store.delete_matching(location, filter).await
                }
            };
            match result {
                Ok(deleted) => debug!(cleanup = ?cleanup, deleted, "Replica data cleaned up"),
                Err(e) => warn!(cleanup = ?cleanup, error = %e, "Replica data cleanup failed"),
            }
        }

        for request in effects.spawn {
            self.spawn_transfer(request);
        }

        for event in &effects.events {
            self.bridge.publish(event);
        }

        for operation in &effects.started {
            self.metrics.record_operation_start();
            info!(
                collection = %operation.collection_id,
                direction = %operation.direction,
                shard_id = operation.shard_id,
                peer_id = operation.peer_id,
                "Resharding started"
            );
        }
        for operation in &effects.finished {
            self.metrics.record_operation_finished();
            info!(
                collection = %operation.collection_id,
                direction = %operation.direction,
                shard_id = operation.shard_id,
                "Resharding finished"
            );
        }
        for aborted in &effects.aborted {
            self.metrics.record_operation_aborted(aborted.forced);
            let operation = &aborted.operation;
            if aborted.forced {
                warn!(
                    collection = %operation.collection_id,
                    stage = %operation.stage,
                    shard_id = operation.shard_id,
                    reason = %aborted.reason,
                    "Resharding force-aborted"
                );
            } else {
                info!(
                    collection = %operation.collection_id,
                    stage = %operation.stage,
                    shard_id = operation.shard_id,
                    "Resharding aborted"
                );
            }
        }
        for (collection, transfer) in &effects.completed_transfers {
            debug!(collection = %collection, transfer = %transfer.key, status = %transfer.status, "Transfer left the table");
        }
    }

    fn spawn_transfer(&self, request: TransferRequest) {
        let reporter: Weak<dyn TransferReporter> = self.weak.clone();
        self.engine.start_transfer(request, reporter);
    }

    /// Requests for every transfer marked running in the committed metadata.
    fn running_transfers(&self) -> Result<Vec<TransferRequest>> {
        let meta = self.metadata.read();
        let mut requests = Vec::new();
        for collection in meta.collection_names() {
            let shard_key = meta.operation(collection).and_then(|op| op.shard_key.clone());
            for transfer in meta.transfers(collection) {
                if transfer.status != TransferStatus::Running {
                    continue;
                }
                let filter = if transfer.is_resharding() {
                    let router = meta.router(collection, shard_key.as_ref())?;
                    Some(router.new_ring_filter(transfer.key.to_shard_id))
                } else {
                    None
                };
                requests.push(TransferRequest {
                    collection: collection.clone(),
                    key: transfer.key,
                    epoch: transfer.epoch,
                    filter,
                });
            }
        }
        Ok(requests)
    }

    /// Commit a transfer report from a detached task, so cancelling the reporting transfer
    /// cannot interrupt the commit.
    async fn commit_detached(&self, op: MetaOperation) -> Result<()> {
        let coordinator = self.weak.upgrade().ok_or(Error::Cancelled)?;
        tokio::spawn(async move {
            coordinator
                .commit_from(Origin::TransferReport, move |_| Ok(op))
                .await
        })
            .await
            .map_err(|e| Error::Internal(format!("report task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl TransferReporter for ReshardingCoordinator {
    async fn transfer_finished(&self, collection: &str, key: TransferKey, epoch: u64) -> Result<()> {
        self.commit_detached(MetaOperation::FinishTransfer {
            collection: collection.to_string(),
            key,
            epoch,
        })
        .await
    }

    async fn transfer_failed(&self, collection: &str, key: TransferKey, epoch: u64, reason: String) -> Result<()> {
        error!(collection, transfer = %key, epoch, reason = %reason, "Reporting failed transfer");
        self.commit_detached(MetaOperation::FailTransfer {
            collection: collection.to_string(),
            key,
            epoch,
            reason,
        })
        .await
    }
}

/// Who asked for a commit. Only requests count toward `rejected_requests`.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Request,
    TransferReport,
}

fn location(collection: &str, replica: &ShardReplica) -> ShardLocation {
    ShardLocation::new(collection, replica.peer_id, replica.shard_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::storage::InMemoryPointStore;
    use crate::testing::utils::wait_for_result;
    use std::time::Duration;

    const COLLECTION: &str = "test";

    async fn coordinator() -> (Arc<ReshardingCoordinator>, Arc<InMemoryPointStore>) {
        let store = Arc::new(InMemoryPointStore::new());
        let config = ReshardingConfig::new(1)
            .with_vnodes_per_shard(32)
            .with_transfer_config(TransferConfig::fast());
        let coordinator = ReshardingCoordinator::new(config, store.clone());
        for peer_id in 1..=3 {
            coordinator.add_peer(peer_id).await.unwrap();
        }
        coordinator
            .create_collection(COLLECTION, CollectionConfig::new(3, 2))
            .await
            .unwrap();
        (coordinator, store)
    }

    async fn wait_for_stage(coordinator: &ReshardingCoordinator, stage: ReshardStage) {
        let reached = wait_for_result(
            || async { coordinator.resharding_operation(COLLECTION).map(|op| op.stage) },
            |current| *current == Some(stage),
            Duration::from_secs(10),
        )
        .await;
        assert!(reached.is_some(), "stage {} not reached", stage);
    }

    #[tokio::test]
    async fn test_upsert_and_get_roundtrip() {
        let (coordinator, _store) = coordinator().await;
        let points = (0..50u64).map(|i| Point::new(i, format!("p{}", i))).collect();
        coordinator.upsert_points(COLLECTION, None, points).await.unwrap();

        let point = coordinator
            .get_point(COLLECTION, None, PointId::Num(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(point.payload, "p7");

        let info = coordinator.get_cluster_info(COLLECTION).await.unwrap();
        assert_eq!(info.peer_id, 1);
        assert_eq!(info.shard_count, 3);
        assert_eq!(info.local_shards.len() + info.remote_shards.len(), 6);
        // Replication factor 2 over 3 shards: every point is stored twice.
        let local: usize = info.local_shards.iter().map(|s| s.points_count).sum();
        assert!(local > 0);
    }

    #[tokio::test]
    async fn test_rejections_are_counted() {
        let (coordinator, _store) = coordinator().await;
        let err = coordinator.commit_read_hash_ring(COLLECTION).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = coordinator.finish_resharding("missing").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(coordinator.metrics().rejected_requests.get(), 2);
    }

    #[tokio::test]
    async fn test_stale_transfer_report_is_counted_apart_from_requests() {
        let (coordinator, _store) = coordinator().await;
        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up())
            .await
            .unwrap();
        let transfer = coordinator.metadata().transfers(COLLECTION)[0].clone();

        let err = coordinator
            .transfer_finished(COLLECTION, transfer.key, transfer.epoch + 100)
            .await
            .unwrap_err();
        // The real task may have reported first, leaving no transfer to match.
        assert!(matches!(
            err,
            Error::StaleTransferReport { .. } | Error::TransferNotFound(_)
        ));
        assert_eq!(coordinator.metrics().rejected_transfer_reports.get(), 1);
        assert_eq!(coordinator.metrics().rejected_requests.get(), 0);
        assert!(coordinator.resharding_operation(COLLECTION).is_some());
    }

    #[tokio::test]
    async fn test_strict_abort_policy() {
        let store = Arc::new(InMemoryPointStore::new());
        let config = ReshardingConfig::new(1)
            .with_transfer_config(TransferConfig::fast())
            .with_abort_after_read_commit(false);
        let coordinator = ReshardingCoordinator::new(config, store);
        for peer_id in 1..=2 {
            coordinator.add_peer(peer_id).await.unwrap();
        }
        coordinator
            .create_collection(COLLECTION, CollectionConfig::new(2, 1))
            .await
            .unwrap();

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up())
            .await
            .unwrap();
        wait_for_stage(&coordinator, ReshardStage::AwaitingReadCommit).await;
        coordinator.commit_read_hash_ring(COLLECTION).await.unwrap();

        let err = coordinator.abort_resharding(COLLECTION).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        // A peer removal still forces the abort through.
        let peer_id = coordinator.resharding_operation(COLLECTION).unwrap().peer_id;
        coordinator.remove_peer(peer_id, true).await.unwrap();
        assert!(coordinator.resharding_operation(COLLECTION).is_none());
        assert_eq!(coordinator.metrics().operations_force_aborted.get(), 1);
    }

    #[tokio::test]
    async fn test_hash_ring_filter_unknown_shard() {
        let (coordinator, _store) = coordinator().await;
        assert!(matches!(
            coordinator.hash_ring_filter(COLLECTION, None, 9),
            Err(Error::ShardNotFound(9))
        ));
        assert!(coordinator.hash_ring_filter(COLLECTION, None, 1).is_ok());
    }

    #[tokio::test]
    async fn test_recover_replays_log_and_resumes_transfers() {
        let store = Arc::new(InMemoryPointStore::new());
        let log = Arc::new(InMemoryMetadataLog::new());
        let config = ReshardingConfig::new(1).with_transfer_config(TransferConfig::fast());

        let mut meta = ClusterMetadata::new(1, config.vnodes_per_shard);
        let mut entries = vec![
            MetaOperation::AddPeer { peer_id: 1 },
            MetaOperation::AddPeer { peer_id: 2 },
            MetaOperation::CreateCollection {
                collection: COLLECTION.to_string(),
                config: CollectionConfig::new(2, 1),
                placement: place_shards(0..2, &[1, 2], 1).unwrap(),
            },
        ];
        for entry in &entries {
            meta.apply(entry).unwrap();
        }
        let plan = plan_resharding(&meta, COLLECTION, &ReshardingRequest::up(), Default::default()).unwrap();
        entries.push(MetaOperation::StartResharding { plan });
        for entry in &entries {
            log.append(entry).await.unwrap();
        }
        for shard_id in 0..2u32 {
            let peer_id = u64::from(shard_id) + 1;
            let points = (0..100u64)
                .map(|i| Point::new(i * 2 + u64::from(shard_id), "v"))
                .collect();
            store
                .upsert(&ShardLocation::new(COLLECTION, peer_id, shard_id), points)
                .await
                .unwrap();
        }

        let coordinator = ReshardingCoordinator::recover(config, store, log.clone())
            .await
            .unwrap();
        let expected = ClusterMetadata::replay(1, coordinator.config().vnodes_per_shard, &entries).unwrap();
        assert_eq!(coordinator.metadata().operation(COLLECTION), expected.operation(COLLECTION));
        assert_eq!(coordinator.resharding_operation(COLLECTION).unwrap().stage, ReshardStage::Starting);

        // The recovered transfers run to completion and report back through the log.
        wait_for_stage(&coordinator, ReshardStage::AwaitingReadCommit).await;
        assert!(log.last_index() > entries.len() as u64);
    }
}
