//! Ordered-commit primitive for cluster metadata.
//!
//! Every metadata change is encoded as a [`MetaOperation`], appended to a
//! [`MetadataLog`] and only then applied. The log gives all control requests a
//! total order: of two racing conflicting requests exactly one is applied
//! first and the other is validated against the result.

mod log;

pub use log::{CommitIndex, InMemoryMetadataLog, MetaOperation, MetadataLog, Placement};
