//! Controller error types.
//!
//! Only infrastructure failures are errors here. Problems with a rollout
//! itself (bad spec, failing plugin, failed analysis) are recorded on the
//! rollout's status and the pass still succeeds.

use thiserror::Error;

use stride_state::StateError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("object store: {0}")]
    State(#[from] StateError),
}

impl ReconcileError {
    /// Whether the pass lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::State(StateError::Conflict { .. }))
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
