//! Cluster topology events and the bridge that turns them into forced aborts.

pub mod bridge;
pub mod events;

pub use bridge::ClusterEventBridge;
pub use events::{LoggingTopologyListener, NoopTopologyListener, TopologyEvent, TopologyListener};
