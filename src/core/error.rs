//! Error types shared by the ingestion and dispatch paths.

use thiserror::Error;

use super::storage::StorageError;
use crate::fleet::grid::DeadlineExceeded;

/// A malformed position event or dispatch query.
///
/// Ingestion drops these and bumps a counter; query entry points hand them
/// back to the caller as `invalid_request`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("agent id is empty")]
    EmptyAgentId,

    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),

    #[error("coordinate is not a finite number")]
    NonFinite,

    #[error("deadline must be greater than zero")]
    ZeroDeadline,
}

/// Errors surfaced by [`crate::DispatchService`] operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// No eligible agent within the maximum search radius. Expected, not a fault.
    #[error("no agent available")]
    NotFound,

    /// The caller's deadline passed before the search finished.
    #[error("dispatch deadline exceeded")]
    Timeout,

    #[error("location store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ingestion queue is full")]
    QueueFull,

    #[error("ingestion pipeline is shut down")]
    PipelineClosed,

    #[error("location store error: {0}")]
    Store(StorageError),
}

impl From<StorageError> for DispatchError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => DispatchError::StoreUnavailable(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DeadlineExceeded> for DispatchError {
    fn from(_: DeadlineExceeded) -> Self {
        DispatchError::Timeout
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
