//! Cluster topology events.

use crate::types::{CollectionId, PeerId, ShardKey};

/// Externally triggered topology changes that can intersect a resharding operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A collection was deleted.
    CollectionDeleted {
        /// The deleted collection.
        collection: CollectionId,
    },

    /// A shard key group was deleted from a custom-sharded collection.
    ShardKeyDeleted {
        /// The owning collection.
        collection: CollectionId,
        /// The deleted shard key.
        shard_key: ShardKey,
    },

    /// A peer was removed from the cluster.
    PeerRemoved {
        /// The removed peer.
        peer_id: PeerId,
        /// Whether its replicas were dropped by force.
        force: bool,
    },
}

impl TopologyEvent {
    /// Collection the event is scoped to. Peer removal affects every collection.
    pub fn collection(&self) -> Option<&str> {
        match self {
            TopologyEvent::CollectionDeleted { collection }
            | TopologyEvent::ShardKeyDeleted { collection, .. } => Some(collection),
            TopologyEvent::PeerRemoved { .. } => None,
        }
    }

    /// Short description used as the reason of a forced abort.
    pub fn describe(&self) -> String {
        match self {
            TopologyEvent::CollectionDeleted { collection } => {
                format!("collection {} deleted", collection)
            }
            TopologyEvent::ShardKeyDeleted {
                collection,
                shard_key,
            } => format!("shard key {} deleted from collection {}", shard_key, collection),
            TopologyEvent::PeerRemoved { peer_id, .. } => format!("peer {} removed", peer_id),
        }
    }
}

/// Listener for committed topology events.
pub trait TopologyListener: Send + Sync + 'static {
    /// Called after the change is committed.
    fn on_event(&self, event: &TopologyEvent);
}

/// No-op event listener.
pub struct NoopTopologyListener;

impl TopologyListener for NoopTopologyListener {
    fn on_event(&self, _event: &TopologyEvent) {}
}

/// Event listener that logs events.
pub struct LoggingTopologyListener;

impl TopologyListener for LoggingTopologyListener {
    fn on_event(&self, event: &TopologyEvent) {
        match event {
            TopologyEvent::CollectionDeleted { collection } => {
                tracing::info!(collection = %collection, "Collection deleted");
            }
            TopologyEvent::ShardKeyDeleted {
                collection,
                shard_key,
            } => {
                tracing::info!(collection = %collection, shard_key = %shard_key, "Shard key deleted");
            }
            TopologyEvent::PeerRemoved { peer_id, force } => {
                tracing::warn!(peer_id, force, "Peer removed from cluster");
            }
        }
    }
}
