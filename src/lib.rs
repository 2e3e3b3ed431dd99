//! Online resharding for replicated, sharded collections.
//!
//! This crate is the control plane that lets a sharded store change its shard
//! count while it keeps serving reads and writes:
//! - **Dual hash rings** route reads and writes separately during a migration
//! - **Background shard transfers** stream points with checkpointed, resumable batches
//! - **An ordered metadata log** gives every control request a total order
//!
//! # Features
//!
//! - One resharding operation per collection, driven through a fixed stage sequence
//! - Up (split in a new shard) and down (merge a shard away) resharding
//! - Abort from any stage restores the old ring and purges migrated data
//! - Collection, shard key and peer deletions abort intersecting operations atomically
//! - Plain replica transfers, replica drops and replica state changes
//!
//! # Example
//!
//! ```rust,no_run
//! use reshard::{
//!     CollectionConfig, InMemoryPointStore, Point, ReshardStage, ReshardingConfig,
//!     ReshardingCoordinator, ReshardingRequest,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryPointStore::new());
//!     let coordinator = ReshardingCoordinator::new(ReshardingConfig::new(1), store);
//!
//!     for peer_id in 1..=3 {
//!         coordinator.add_peer(peer_id).await?;
//!     }
//!     coordinator.create_collection("docs", CollectionConfig::new(3, 2)).await?;
//!     coordinator
//!         .upsert_points("docs", None, vec![Point::new(1u64, "hello")])
//!         .await?;
//!
//!     // Add a fourth shard. Transfers start in the background.
//!     coordinator.start_resharding("docs", ReshardingRequest::up()).await?;
//!
//!     // Once every transfer has finished the operation waits for the operator.
//!     while coordinator.resharding_operation("docs").map(|op| op.stage)
//!         != Some(ReshardStage::AwaitingReadCommit)
//!     {
//!         tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     }
//!     coordinator.commit_read_hash_ring("docs").await?;
//!     coordinator.commit_write_hash_ring("docs").await?;
//!     coordinator.finish_resharding("docs").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Operator / Collection API        │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          ReshardingCoordinator              │
//! │  • start / commit_read / commit_write       │
//! │  • finish / abort                           │
//! │  • replicate_shard / drop_replica           │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┬───────────────┐
//!     ▼               ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │Metadata │   │ Cluster  │   │ Transfer  │   │  Point   │
//! │  Log    │   │ Metadata │   │  Engine   │   │  Store   │
//! └─────────┘   └──────────┘   └───────────┘   └──────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Metadata**: every change is appended to the [`MetadataLog`] before it is
//!   applied; replaying the log reproduces the same [`ClusterMetadata`]
//! - **Writes**: delivered to the owners under both rings while an operation is live
//! - **Reads**: follow the read ring, which switches at `commit_read_hash_ring`

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod error;
pub mod metrics;
pub mod partitioning;
pub mod resharding;
pub mod storage;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{ReshardingConfig, ShardSelectionPolicy, TransferConfig};
pub use error::{Error, Result, StorageError};
pub use types::{
    CollectionConfig, CollectionId, PeerId, Point, PointId, ReplicaState, ReshardingDirection,
    ShardId, ShardKey, ShardingMethod,
};

// Re-export resharding types
pub use resharding::{
    ClusterMetadata, CollectionClusterInfo, LocalShardInfo, RemoteShardInfo, ReshardStage,
    ReshardingCoordinator, ReshardingInfo, ReshardingOperation, ReshardingRequest,
    ShardTransfer, ShardTransferInfo, TransferKey, TransferMethod, TransferStatus,
};

// Re-export cluster types
pub use cluster::{ClusterEventBridge, TopologyEvent, TopologyListener};

// Re-export metadata log types
pub use consensus::{InMemoryMetadataLog, MetaOperation, MetadataLog};

// Re-export partitioning types
pub use partitioning::{HashRing, HashRingFilter, HashRingRouter};

// Re-export storage types
pub use storage::{InMemoryPointStore, PointStore, ShardLocation};

// Re-export metrics types
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot, ReshardingMetrics};
