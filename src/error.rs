//! Error taxonomy shared by the mediator, the mutation coordinator and the
//! repositories.
//!
//! Every remote or storage failure is mapped into [`SyncError`] at the edge
//! where it happens; callers match on it exhaustively.

use thiserror::Error;

use crate::entity::{EntityId, EntityKind};
use crate::mutation::OperationKind;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No connectivity, DNS failure, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-2xx status or an unreadable body.
    #[error("remote rejected request (status {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Point lookup of a record the server no longer has.
    #[error("{kind} {id} no longer exists on the remote")]
    NotFound { kind: EntityKind, id: EntityId },

    /// Local transaction failure. Never retried.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} is not supported for {kind}")]
    Unsupported {
        kind: EntityKind,
        operation: OperationKind,
    },
}

impl SyncError {
    /// Whether repeating the exact same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::RemoteRejected { .. } | SyncError::Cancelled
        )
    }

    /// Local storage failures are not something the sync protocol can reason about.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SyncError::Network(_) => "network",
            SyncError::RemoteRejected { .. } => "rejected",
            SyncError::NotFound { .. } => "not_found",
            SyncError::Storage(_) => "storage",
            SyncError::Cancelled => "cancelled",
            SyncError::Unsupported { .. } => "unsupported",
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// A failed optimistic mutation, carrying enough context to retry it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} on {kind} {id} failed: {source}")]
pub struct MutationError {
    pub kind: EntityKind,
    pub id: EntityId,
    pub operation: OperationKind,
    #[source]
    pub source: SyncError,
}

impl MutationError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}
