//! Error types for allocation health tracking.

use thiserror::Error;

/// Errors raised when setting up a tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("task group {group} not found for allocation {alloc_id}")]
    TaskGroupNotFound { alloc_id: String, group: String },
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// A failed lookup against the external service registry.
///
/// Always treated as transient: the tracker retries on its next poll.
#[derive(Debug, Error)]
#[error("registry lookup failed: {0}")]
pub struct RegistryError(pub String);
