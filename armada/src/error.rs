use thiserror::Error;

use crate::job::{Jid, JobState};
use crate::task::TaskId;

/// Error taxonomy shared by every armada component.
///
/// Trait seams return `anyhow::Result`; these variants travel inside the
/// `anyhow::Error` and can be recovered with `downcast_ref::<ArmadaError>()`.
#[derive(Debug, Error)]
pub enum ArmadaError {
    /// Broker, store, or execution plane unreachable. Retried automatically.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The work itself failed. The message is kept verbatim for operators.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Cancellation requested by someone other than the submitter.
    #[error("task {task_id} is owned by another user (requested by {requester})")]
    NotOwner { task_id: TaskId, requester: String },

    /// A write tried to leave a terminal state or skip a state.
    #[error("illegal job transition for {jid}: {from} -> {to}")]
    IllegalTransition { jid: Jid, from: JobState, to: JobState },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("not found: {0}")]
    NotFound(String),

    /// Cancellation arrived after the work started.
    #[error("cancel rejected: {0}")]
    CancelRejected(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ArmadaError {
    /// Wraps a backend error as a transient failure.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        ArmadaError::Transient(err.to_string())
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ArmadaError::Transient(_) | ArmadaError::Timeout(_))
    }
}

impl From<serde_json::Error> for ArmadaError {
    fn from(err: serde_json::Error) -> Self {
        ArmadaError::Serialization(err.to_string())
    }
}
