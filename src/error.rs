//! Hadron lease error abstractions.

use std::time::Duration;

use crate::models::{MemberId, PartitionId};

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// Application error variants.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The target resource was not found.
    #[error("the target resource was not found: {0}")]
    ResourceNotFound(String),
}

/// Errors of the partition lease protocol.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// A member acknowledged a lease transition for a partition it was never offered.
    ///
    /// This indicates a broken collaborator, and is never silently ignored.
    #[error("protocol violation: member {member} acknowledged partition {partition} which it was never offered")]
    ProtocolViolation { member: MemberId, partition: PartitionId },
    /// A lock listener did not settle its acknowledgement within the allotted time.
    #[error("lock listener did not acknowledge within {0:?}")]
    AckTimeout(Duration),
    /// The lock manager has shut down and can no longer service requests.
    #[error("the lock manager has shut down")]
    ManagerClosed,
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
