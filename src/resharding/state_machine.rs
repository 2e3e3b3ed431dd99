//! Legal stage transitions of a resharding operation.
//!
//! ```text
//!  Idle ──start──▶ Starting ──transfers finished──▶ AwaitingReadCommit
//!                                                      │ commit_read_hash_ring
//!                                                      ▼
//!  Idle ◀──finish── AwaitingFinish ◀──commit_write── AwaitingWriteCommit
//!
//!  any non-Idle stage ──abort──▶ Idle
//! ```
//!
//! Every stage has exactly one forward action. Anything else is rejected and
//! leaves the stage unchanged, so a phase can never be applied twice and a
//! partially failed request is resumed by reissuing the expected call.

use super::operation::ReshardStage;
use crate::error::{Error, Result};
use std::fmt;

/// Trigger applied to a collection's resharding stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshardAction {
    Start,
    TransfersFinished,
    CommitReadHashRing,
    CommitWriteHashRing,
    Finish,
    /// Explicit operator abort, or a forced abort from a topology change or transfer failure.
    Abort { forced: bool },
}

impl fmt::Display for ReshardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReshardAction::Start => write!(f, "start_resharding"),
            ReshardAction::TransfersFinished => write!(f, "transfers_finished"),
            ReshardAction::CommitReadHashRing => write!(f, "commit_read_hash_ring"),
            ReshardAction::CommitWriteHashRing => write!(f, "commit_write_hash_ring"),
            ReshardAction::Finish => write!(f, "finish_resharding"),
            ReshardAction::Abort { forced: false } => write!(f, "abort_resharding"),
            ReshardAction::Abort { forced: true } => write!(f, "forced_abort_resharding"),
        }
    }
}

/// Transition table with the abort policy applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReshardingStateMachine {
    allow_abort_after_read_commit: bool,
}

impl Default for ReshardingStateMachine {
    fn default() -> Self {
        Self {
            allow_abort_after_read_commit: true,
        }
    }
}

impl ReshardingStateMachine {
    pub fn new(allow_abort_after_read_commit: bool) -> Self {
        Self {
            allow_abort_after_read_commit,
        }
    }

    /// Stage after applying `action` to `current` (`None` is Idle).
    pub fn next(
        &self,
        current: Option<ReshardStage>,
        action: ReshardAction,
    ) -> Result<Option<ReshardStage>> {
        use ReshardAction as A;
        use ReshardStage as S;

        let next = match (current, action) {
            (None, A::Start) => Some(S::Starting),
            (Some(S::Starting), A::TransfersFinished) => Some(S::AwaitingReadCommit),
            (Some(S::AwaitingReadCommit), A::CommitReadHashRing) => Some(S::AwaitingWriteCommit),
            (Some(S::AwaitingWriteCommit), A::CommitWriteHashRing) => Some(S::AwaitingFinish),
            (Some(S::AwaitingFinish), A::Finish) => None,
            (Some(stage), A::Abort { forced }) => {
                if !forced && !self.allow_abort_after_read_commit && stage.read_committed() {
                    return Err(Error::invalid_transition(action.to_string(), stage));
                }
                None
            }
            (Some(stage), _) => return Err(Error::invalid_transition(action.to_string(), stage)),
            (None, _) => return Err(Error::invalid_transition(action.to_string(), "idle")),
        };
        Ok(next)
    }
}
