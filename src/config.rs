//! Configuration types for the resharding orchestrator.

use crate::types::PeerId;
use std::time::Duration;

/// Main configuration for the resharding coordinator.
#[derive(Debug, Clone)]
pub struct ReshardingConfig {
    /// Peer id of the local process. Determines local vs remote shards in cluster info.
    pub this_peer_id: PeerId,

    /// Virtual nodes per shard on the hash ring.
    pub vnodes_per_shard: usize,

    /// Shard transfer settings.
    pub transfer: TransferConfig,

    /// Which shard to remove when a down-resharding request names none.
    pub down_shard_policy: ShardSelectionPolicy,

    /// Whether an explicit abort is accepted once the read ring is committed.
    /// Forced aborts from topology changes and transfer failures always proceed.
    pub allow_abort_after_read_commit: bool,
}

impl Default for ReshardingConfig {
    fn default() -> Self {
        Self {
            this_peer_id: 1,
            vnodes_per_shard: crate::partitioning::DEFAULT_VNODES_PER_SHARD,
            transfer: TransferConfig::default(),
            down_shard_policy: ShardSelectionPolicy::default(),
            allow_abort_after_read_commit: true,
        }
    }
}

impl ReshardingConfig {
    /// Create a configuration for the given local peer.
    pub fn new(this_peer_id: PeerId) -> Self {
        Self {
            this_peer_id,
            ..Default::default()
        }
    }

    /// Set the number of virtual nodes per shard.
    pub fn with_vnodes_per_shard(mut self, vnodes: usize) -> Self {
        self.vnodes_per_shard = vnodes.max(1);
        self
    }

    /// Set the transfer configuration.
    pub fn with_transfer_config(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Set the down-resharding shard selection policy.
    pub fn with_down_shard_policy(mut self, policy: ShardSelectionPolicy) -> Self {
        self.down_shard_policy = policy;
        self
    }

    /// Allow or refuse explicit abort after the read ring is committed.
    pub fn with_abort_after_read_commit(mut self, allow: bool) -> Self {
        self.allow_abort_after_read_commit = allow;
        self
    }
}

/// Configuration for shard transfers.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Points per batch.
    pub batch_size: usize,

    /// Retries per batch before the transfer reports failure.
    pub max_retries: u32,

    /// Initial backoff between retries.
    pub retry_backoff: Duration,

    /// Upper bound on backoff.
    pub max_backoff: Duration,

    /// Verify destination against source before reporting completion.
    pub verify_on_finish: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            verify_on_finish: true,
        }
    }
}

impl TransferConfig {
    /// Config with short backoff, for tests.
    pub fn fast() -> Self {
        Self {
            retry_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..Default::default()
        }
    }

    /// Set batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set max retries per batch.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set retry backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Enable or disable completion verification.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_on_finish = verify;
        self
    }

    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Shard chosen for removal by down-resharding when the request names none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardSelectionPolicy {
    /// Highest shard id in the shard group.
    #[default]
    Last,
    /// Lowest shard id in the shard group.
    First,
}
