//! Shard replica registry.
//!
//! Holds one `(shard, peer) -> state` table per collection. Tables are shared
//! behind `Arc` and copied on write, so a reader's snapshot never changes under
//! it. The registry has no lock of its own: it lives inside the cluster
//! metadata, which is only mutated by the coordinator's commit path after the
//! change is recorded in the metadata log.

use crate::error::{Error, Result};
use crate::types::{CollectionId, PeerId, ReplicaState, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type ReplicaTable = BTreeMap<ShardId, BTreeMap<PeerId, ReplicaState>>;

/// One replica of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReplica {
    pub shard_id: ShardId,
    pub peer_id: PeerId,
    pub state: ReplicaState,
}

/// Replicas of a collection split by locality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub local_shards: Vec<ShardReplica>,
    pub remote_shards: Vec<ShardReplica>,
}

impl ReplicaSnapshot {
    /// Every replica, local first.
    pub fn all(&self) -> impl Iterator<Item = &ShardReplica> {
        self.local_shards.iter().chain(self.remote_shards.iter())
    }

    pub fn count_in_state(&self, state: ReplicaState) -> usize {
        self.all().filter(|replica| replica.state == state).count()
    }
}

/// Registry of shard replicas for every collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReplicaRegistry {
    this_peer_id: PeerId,
    collections: HashMap<CollectionId, Arc<ReplicaTable>>,
}

impl ShardReplicaRegistry {
    pub fn new(this_peer_id: PeerId) -> Self {
        Self {
            this_peer_id,
            collections: HashMap::new(),
        }
    }

    /// Snapshot of a collection's replicas, split into local and remote.
    pub fn get(&self, collection: &str) -> Result<ReplicaSnapshot> {
        let table = self.table(collection)?;
        let mut snapshot = ReplicaSnapshot::default();
        for replica in Self::flatten(&table) {
            if replica.peer_id == self.this_peer_id {
                snapshot.local_shards.push(replica);
            } else {
                snapshot.remote_shards.push(replica);
            }
        }
        Ok(snapshot)
    }

    /// Every replica of a collection, ordered by shard then peer.
    pub fn replicas(&self, collection: &str) -> Result<Vec<ShardReplica>> {
        let table = self.table(collection)?;
        Ok(Self::flatten(&table).collect())
    }

    /// Replicas of one shard.
    pub fn shard_replicas(&self, collection: &str, shard_id: ShardId) -> Result<Vec<ShardReplica>> {
        let table = self.table(collection)?;
        let peers = table.get(&shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        Ok(peers
            .iter()
            .map(|(&peer_id, &state)| ShardReplica {
                shard_id,
                peer_id,
                state,
            })
            .collect())
    }

    /// State of one replica.
    pub fn state(&self, collection: &str, shard_id: ShardId, peer_id: PeerId) -> Result<ReplicaState> {
        self.table(collection)?
            .get(&shard_id)
            .and_then(|peers| peers.get(&peer_id))
            .copied()
            .ok_or(Error::ReplicaNotFound { shard_id, peer_id })
    }

    /// Whether the collection has a replica of the shard on the peer.
    pub fn contains(&self, collection: &str, shard_id: ShardId, peer_id: PeerId) -> bool {
        self.state(collection, shard_id, peer_id).is_ok()
    }

    /// Replicas of a collection hosted by the peer.
    pub fn replica_count_on(&self, collection: &str, peer_id: PeerId) -> usize {
        self.collections
            .get(collection)
            .map(|table| table.values().filter(|peers| peers.contains_key(&peer_id)).count())
            .unwrap_or(0)
    }

    /// Every `(collection, replica)` hosted by the peer.
    pub fn replicas_on_peer(&self, peer_id: PeerId) -> Vec<(CollectionId, ShardReplica)> {
        let mut found = Vec::new();
        for (collection, table) in &self.collections {
            for replica in Self::flatten(table).filter(|r| r.peer_id == peer_id) {
                found.push((collection.clone(), replica));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.shard_id.cmp(&b.1.shard_id)));
        found
    }

    pub(crate) fn register_collection(&mut self, collection: &str) {
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(BTreeMap::new()));
    }

    pub(crate) fn remove_collection(&mut self, collection: &str) -> Option<Vec<ShardReplica>> {
        let table = self.collections.remove(collection)?;
        let replicas: Vec<ShardReplica> = Self::flatten(&table).collect();
        Some(replicas)
    }

    /// Add a replica, or overwrite the state of an existing one.
    pub(crate) fn insert(
        &mut self,
        collection: &str,
        shard_id: ShardId,
        peer_id: PeerId,
        state: ReplicaState,
    ) -> Result<()> {
        let table = self.table_mut(collection)?;
        Arc::make_mut(table)
            .entry(shard_id)
            .or_default()
            .insert(peer_id, state);
        Ok(())
    }

    /// Change the state of an existing replica. Returns the previous state.
    pub fn set_state(
        &mut self,
        collection: &str,
        shard_id: ShardId,
        peer_id: PeerId,
        state: ReplicaState,
    ) -> Result<ReplicaState> {
        let previous = self.state(collection, shard_id, peer_id)?;
        if previous != state {
            let table = Arc::make_mut(self.table_mut(collection)?);
            if let Some(peers) = table.get_mut(&shard_id) {
                peers.insert(peer_id, state);
            }
        }
        Ok(previous)
    }

    /// Remove a replica. The shard entry disappears with its last replica.
    pub fn remove(&mut self, collection: &str, shard_id: ShardId, peer_id: PeerId) -> Result<ReplicaState> {
        let previous = self.state(collection, shard_id, peer_id)?;
        let table = Arc::make_mut(self.table_mut(collection)?);
        if let Some(peers) = table.get_mut(&shard_id) {
            peers.remove(&peer_id);
            if peers.is_empty() {
                table.remove(&shard_id);
            }
        }
        Ok(previous)
    }

    /// Remove every replica of a shard. Returns the removed replicas.
    pub(crate) fn remove_shard(&mut self, collection: &str, shard_id: ShardId) -> Result<Vec<ShardReplica>> {
        let table = Arc::make_mut(self.table_mut(collection)?);
        Ok(table
            .remove(&shard_id)
            .map(|peers| {
                peers
                    .into_iter()
                    .map(|(peer_id, state)| ShardReplica {
                        shard_id,
                        peer_id,
                        state,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn table(&self, collection: &str) -> Result<Arc<ReplicaTable>> {
        self.collections
            .get(collection)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    fn table_mut(&mut self, collection: &str) -> Result<&mut Arc<ReplicaTable>> {
        self.collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    fn flatten(table: &ReplicaTable) -> impl Iterator<Item = ShardReplica> + '_ {
        table.iter().flat_map(|(&shard_id, peers)| {
            peers.iter().map(move |(&peer_id, &state)| ShardReplica {
                shard_id,
                peer_id,
                state,
            })
        })
    }
}
