//! Remote collaborators.
//!
//! - [`http`]: reqwest-backed [`RemoteApi`] implementation
//! - [`media`]: attachment upload
//! - [`fake`]: scriptable in-memory remote for tests and offline runs

pub mod fake;
pub mod http;
pub mod media;

use async_trait::async_trait;

use crate::entity::{Attachment, Entity, EntityId};
use crate::error::SyncError;
use crate::mutation::{OperationKind, PendingAttachment};

/// Remote API for one entity kind.
///
/// Every method maps transport failures to [`SyncError::Network`] and non-2xx
/// answers to [`SyncError::RemoteRejected`] (or [`SyncError::NotFound`] for
/// point lookups).
#[async_trait]
pub trait RemoteApi<E: Entity>: Send + Sync {
    /// Newest `count` records.
    async fn get_latest(&self, count: usize) -> Result<Vec<E>, SyncError>;

    /// Up to `count` records older than `id`.
    async fn get_before(&self, id: EntityId, count: usize) -> Result<Vec<E>, SyncError>;

    /// Up to `count` records newer than `id`.
    async fn get_after(&self, id: EntityId, count: usize) -> Result<Vec<E>, SyncError>;

    /// Every record newer than `id`.
    async fn get_newer(&self, id: EntityId) -> Result<Vec<E>, SyncError>;

    async fn get_by_id(&self, id: EntityId) -> Result<E, SyncError>;

    /// Create (id 0) or update a record; returns the stored version.
    async fn save(&self, record: E) -> Result<E, SyncError>;

    async fn delete_by_id(&self, id: EntityId) -> Result<(), SyncError>;

    async fn like(&self, id: EntityId) -> Result<E, SyncError>;

    async fn unlike(&self, id: EntityId) -> Result<E, SyncError>;

    async fn participate(&self, _id: EntityId) -> Result<E, SyncError> {
        Err(SyncError::Unsupported {
            kind: E::KIND,
            operation: OperationKind::Participate,
        })
    }

    async fn unparticipate(&self, _id: EntityId) -> Result<E, SyncError> {
        Err(SyncError::Unsupported {
            kind: E::KIND,
            operation: OperationKind::Unparticipate,
        })
    }
}

/// Uploads a local file and returns the hosted attachment.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, attachment: &PendingAttachment) -> Result<Attachment, SyncError>;
}
