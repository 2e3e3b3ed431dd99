//! Partitioning of points across the shards of a collection.
//!
//! Each shard group (the whole collection, or one shard key of a custom-sharded
//! collection) owns a consistent hash ring mapping point ids to shard ids. During
//! resharding the group's [`HashRingRouter`] carries two rings at once.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HashRingRouter                            │
//! │   old ring (v1) ──┬── read ring                              │
//! │                   └── write ring      ┌──────────────────┐   │
//! │   new ring (v2) ─────────────────────▶│  HashRingFilter  │   │
//! │                                       │ expected shard N │   │
//! │  ┌──────────────────────────────────┐ └──────────────────┘   │
//! │  │ HashRing: 128 vnodes per shard   │                        │
//! │  │ point id → hash → vnode → shard  │                        │
//! │  └──────────────────────────────────┘                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod hashring;
mod router;

pub use hashring::{HashRing, DEFAULT_VNODES_PER_SHARD};
pub use router::{HashRingFilter, HashRingRouter, RingChange, VersionedRing};
