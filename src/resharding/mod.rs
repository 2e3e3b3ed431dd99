//! Resharding: growing or shrinking a live collection by one shard.
//!
//! An operation moves a collection through a fixed sequence of stages while
//! points keep being read and written:
//!
//! ```text
//!          start                transfers           commit_read
//!   Idle ─────────▶ Starting ──────────────▶ AwaitingReadCommit ──────────▶
//!    ▲                 │        finished             │
//!    │                 │                             │
//!    │   abort         ▼                             ▼
//!    ├──────────────── ● ◀───────────────────────── ● ◀──────┐
//!    │                                                       │ abort
//!    │  finish                     commit_write              │
//!    └───────── AwaitingFinish ◀────────────── AwaitingWriteCommit
//! ```
//!
//! - **Up** adds shard `N` on one peer. Each existing shard streams the points
//!   the new ring assigns to `N` into it.
//! - **Down** removes a shard. Its points are streamed into every replica of
//!   the shards that inherit them under the new ring.
//!
//! Writes go to both rings until the write ring is committed; reads follow
//! the old ring until the read ring is committed. Abort restores the old
//! ring and purges data that only the new ring would have owned.
//!
//! All state lives in [`ClusterMetadata`] and changes only through committed
//! [`MetaOperation`](crate::consensus::MetaOperation) entries, driven by the
//! [`ReshardingCoordinator`].

mod coordinator;
mod metadata;
mod operation;
mod planner;
mod registry;
mod state_machine;
mod transfer;
mod transfer_engine;

pub use coordinator::{
    CollectionClusterInfo, LocalShardInfo, RemoteShardInfo, ReshardingCoordinator, ReshardingInfo,
    ShardTransferInfo,
};
pub use metadata::{AbortedOperation, ClusterMetadata, CollectionMeta, DataCleanup, Effects};
pub use operation::{ReshardStage, ReshardingOperation, ReshardingRequest};
pub use planner::{place_shards, plan_resharding, ReshardingPlan};
pub use registry::{ReplicaSnapshot, ShardReplica, ShardReplicaRegistry};
pub use state_machine::{ReshardAction, ReshardingStateMachine};
pub use transfer::{
    check_transfer_conflicts, suggest_transfer_source, ShardTransfer, TransferKey, TransferMethod,
    TransferStatus,
};
pub use transfer_engine::{
    TransferCheckpoint, TransferEngine, TransferProgress, TransferReporter, TransferRequest,
};
