//! Point storage collaborator.
//!
//! The orchestrator never owns point data. It reads, writes and purges shard
//! replicas through the [`PointStore`] trait, addressed by [`ShardLocation`].

mod point_store;

pub use point_store::{InMemoryPointStore, PointBatch, PointStore, ShardLocation};
