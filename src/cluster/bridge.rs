//! Cluster event bridge.
//!
//! Topology changes reach resharding in two steps:
//!
//! ```text
//!   delete_collection / delete_shard_key / remove_peer(force)
//!        │
//!        ▼
//!   ClusterMetadata::apply ──▶ ClusterEventBridge::affected_operations
//!        │                        (which live operations intersect?)
//!        │  forced abort of each, inside the same metadata entry
//!        ▼
//!   commit ──▶ ClusterEventBridge::publish ──▶ TopologyListener::on_event
//! ```
//!
//! The abort is decided while the deletion is being applied, so no committed
//! state ever holds an operation that references a deleted entity. Listeners
//! only observe the outcome.

use super::events::{TopologyEvent, TopologyListener};
use crate::resharding::ClusterMetadata;
use crate::types::{CollectionId, ReplicaState};
use parking_lot::RwLock;
use std::sync::Arc;

/// Fans committed topology events out to listeners.
pub struct ClusterEventBridge {
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
}

impl std::fmt::Debug for ClusterEventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEventBridge")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl Default for ClusterEventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterEventBridge {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for committed events.
    pub fn subscribe(&self, listener: Arc<dyn TopologyListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver a committed event to every listener.
    pub fn publish(&self, event: &TopologyEvent) {
        let listeners = self.listeners.read().clone();
        tracing::debug!(event = ?event, listeners = listeners.len(), "Publishing topology event");
        for listener in listeners {
            listener.on_event(event);
        }
    }

    /// Collections whose live resharding operation the event invalidates.
    ///
    /// Evaluated against the metadata before the event's change is applied.
    pub fn affected_operations(meta: &ClusterMetadata, event: &TopologyEvent) -> Vec<CollectionId> {
        match event {
            TopologyEvent::CollectionDeleted { collection } => meta
                .operation(collection)
                .map(|op| vec![op.collection_id.clone()])
                .unwrap_or_default(),
            TopologyEvent::ShardKeyDeleted {
                collection,
                shard_key,
            } => meta
                .operation(collection)
                .filter(|op| op.shard_key.as_ref() == Some(shard_key))
                .map(|op| vec![op.collection_id.clone()])
                .unwrap_or_default(),
            TopologyEvent::PeerRemoved { peer_id, .. } => meta
                .operations()
                .filter(|op| {
                    let collection = op.collection_id.as_str();
                    let hosts_resharding_replica = meta
                        .registry()
                        .replicas(collection)
                        .map(|replicas| {
                            replicas.iter().any(|replica| {
                                replica.peer_id == *peer_id
                                    && replica.state == ReplicaState::Resharding
                            })
                        })
                        .unwrap_or(false);
                    let in_transfer = meta
                        .transfers(collection)
                        .iter()
                        .any(|transfer| transfer.is_resharding() && transfer.key.involves_peer(*peer_id));
                    op.involves_peer(*peer_id) || hosts_resharding_replica || in_transfer
                })
                .map(|op| op.collection_id.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingListener {
        events: Mutex<Vec<TopologyEvent>>,
    }

    impl TopologyListener for RecordingListener {
        fn on_event(&self, event: &TopologyEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn test_publish_reaches_every_listener() {
        let bridge = ClusterEventBridge::new();
        let first = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        });
        let second = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        });
        bridge.subscribe(first.clone());
        bridge.subscribe(second.clone());
        bridge.subscribe(Arc::new(super::super::events::NoopTopologyListener));
        assert_eq!(bridge.listener_count(), 3);

        let event = TopologyEvent::CollectionDeleted {
            collection: "c".into(),
        };
        bridge.publish(&event);
        assert_eq!(first.events.lock().as_slice(), &[event.clone()]);
        assert_eq!(second.events.lock().as_slice(), &[event]);
    }

    #[test]
    fn test_peer_hosting_only_receiver_replica_is_affected() {
        use crate::config::ShardSelectionPolicy;
        use crate::consensus::MetaOperation;
        use crate::resharding::{place_shards, plan_resharding, ReshardStage, ReshardingRequest, TransferStatus};
        use crate::types::CollectionConfig;

        let mut meta = ClusterMetadata::new(1, 16);
        for peer_id in 1..=4 {
            meta.apply(&MetaOperation::AddPeer { peer_id }).unwrap();
        }
        meta.apply(&MetaOperation::CreateCollection {
            collection: "c".into(),
            config: CollectionConfig::new(3, 2),
            placement: place_shards(0..3, &[1, 2, 3], 2).unwrap(),
        })
        .unwrap();
        let plan = plan_resharding(&meta, "c", &ReshardingRequest::down(), ShardSelectionPolicy::Last).unwrap();
        let source = plan.operation.peer_id;
        meta.apply(&MetaOperation::StartResharding { plan }).unwrap();

        // Once every transfer is done only the replica states tie receivers to the operation.
        while let Some(transfer) = meta
            .transfers("c")
            .iter()
            .find(|t| t.status == TransferStatus::Running)
            .cloned()
        {
            meta.apply(&MetaOperation::FinishTransfer {
                collection: "c".into(),
                key: transfer.key,
                epoch: transfer.epoch,
            })
            .unwrap();
        }
        assert_eq!(meta.operation("c").unwrap().stage, ReshardStage::AwaitingReadCommit);
        assert!(meta.transfers("c").is_empty());

        let receiver = meta
            .registry()
            .replicas("c")
            .unwrap()
            .into_iter()
            .find(|replica| replica.state == ReplicaState::Resharding && replica.peer_id != source)
            .unwrap()
            .peer_id;
        let removed = |peer_id| TopologyEvent::PeerRemoved { peer_id, force: true };
        assert_eq!(
            ClusterEventBridge::affected_operations(&meta, &removed(receiver)),
            vec!["c".to_string()]
        );
        // Peer 4 hosts nothing of the collection.
        assert!(ClusterEventBridge::affected_operations(&meta, &removed(4)).is_empty());
    }

    #[test]
    fn test_no_operations_no_aborts() {
        let meta = ClusterMetadata::new(1, 16);
        let event = TopologyEvent::PeerRemoved {
            peer_id: 1,
            force: true,
        };
        assert!(ClusterEventBridge::affected_operations(&meta, &event).is_empty());
    }
}
