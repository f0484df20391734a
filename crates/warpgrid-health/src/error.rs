//! Error types for the checks subsystem.

use thiserror::Error;

/// Errors that can occur while managing an allocation's checks.
#[derive(Debug, Error)]
pub enum ChecksError {
    #[error("task group {group} not found for allocation {alloc_id}")]
    TaskGroupNotFound { alloc_id: String, group: String },

    #[error("state store error: {0}")]
    State(#[from] warpgrid_state::StateError),
}

pub type ChecksResult<T> = Result<T, ChecksError>;
