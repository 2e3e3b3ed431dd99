//! Error types for the resharding orchestrator.

use crate::types::{CollectionId, PeerId, ShardId, ShardKey};
use thiserror::Error;

/// Result type alias for resharding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resharding orchestrator.
#[derive(Error, Debug)]
pub enum Error {
    /// Request does not match the single legal next action of the current stage.
    #[error("wrong resharding stage: {action} is not allowed in stage {stage}")]
    InvalidTransition { action: String, stage: String },

    /// A resharding operation is already running for the collection.
    #[error("resharding operation already in progress for collection {collection}: {operation}")]
    OperationInProgress {
        collection: CollectionId,
        operation: String,
    },

    /// Collection not found.
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionId),

    /// Shard key not found in the collection.
    #[error("shard key not found: {0}")]
    ShardKeyNotFound(ShardKey),

    /// Peer not found in the cluster.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Shard not found in the collection.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// No replica of the shard on the peer.
    #[error("replica of shard {shard_id} not found on peer {peer_id}")]
    ReplicaNotFound { shard_id: ShardId, peer_id: PeerId },

    /// Shard transfer not found (already finished or cancelled).
    #[error("shard transfer not found: {0}")]
    TransferNotFound(String),

    /// A transfer report names a transfer scheduled by an earlier entry.
    #[error("stale report for shard transfer {transfer}: reported epoch {reported}, current epoch {current}")]
    StaleTransferReport {
        transfer: String,
        reported: u64,
        current: u64,
    },

    /// A transfer conflicts with one already in flight.
    #[error("shard transfer conflict: {0}")]
    TransferConflict(String),

    /// A transfer exhausted its retry budget or failed verification.
    #[error("shard transfer failed: {0}")]
    TransferFailed(String),

    /// Topology changed under a running operation.
    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    /// Request is malformed or violates a topology rule.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Point storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Metadata log encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Point storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Peer is unreachable for data-plane requests.
    #[error("peer {0} unreachable")]
    Unavailable(PeerId),

    /// Request to the peer timed out.
    #[error("request to peer {0} timed out")]
    Timeout(PeerId),

    /// Storage I/O error.
    #[error("storage io error: {0}")]
    Io(String),
}

impl Error {
    /// HTTP status code this error maps to on the control surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidTransition { .. }
            | Error::OperationInProgress { .. }
            | Error::TransferConflict(_)
            | Error::StaleTransferReport { .. }
            | Error::TopologyConflict(_)
            | Error::BadRequest(_) => 400,
            Error::CollectionNotFound(_)
            | Error::ShardKeyNotFound(_)
            | Error::PeerNotFound(_)
            | Error::ShardNotFound(_)
            | Error::ReplicaNotFound { .. }
            | Error::TransferNotFound(_) => 404,
            Error::TransferFailed(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Cancelled
            | Error::Internal(_) => 500,
        }
    }

    /// Whether a transfer should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub(crate) fn invalid_transition(action: impl Into<String>, stage: impl ToString) -> Self {
        Error::InvalidTransition {
            action: action.into(),
            stage: stage.to_string(),
        }
    }

    pub(crate) fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
