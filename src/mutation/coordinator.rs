//! Optimistic mutation coordinator.
//!
//! Every mutation follows the same protocol:
//! 1. Apply the local delta in one store transaction (visible immediately)
//! 2. Call the remote (uploading a pending attachment first for saves)
//! 3. On success, commit the server's record over the local one
//! 4. On failure or cancellation, revert the delta and return a typed error
//!
//! At most one mutation per `(id, family)` is in flight. A newer call cancels
//! the older one and waits for its rollback before touching the store. The
//! protocol runs on a spawned task, so dropping the caller's future cancels
//! the remote call but never skips the rollback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entity::record::new_staged_id;
use crate::entity::{Entity, EntityId};
use crate::error::{MutationError, SyncError};
use crate::metrics::SyncMetrics;
use crate::mutation::delta::{LocalDelta, Mutation, OpFamily, OperationKind};
use crate::remote::{MediaUploader, RemoteApi};
use crate::store::{EntityStore, StoreError};

/// Removes records that belong to a deleted parent.
#[async_trait]
pub trait CascadeDelete: Send + Sync {
    async fn delete_children(&self, parent: EntityId) -> Result<usize, StoreError>;
}

#[async_trait]
impl<C: Entity> CascadeDelete for EntityStore<C> {
    async fn delete_children(&self, parent: EntityId) -> Result<usize, StoreError> {
        let removed = self
            .delete_where(|child| child.parent_id() == Some(parent))
            .await?;
        Ok(removed.len())
    }
}

/// What the remote answered for a successful call.
enum RemoteAnswer<E> {
    Record(E),
    Deleted,
}

/// In-flight bookkeeping for one `(id, family)`.
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    token: CancellationToken,
    seq: u64,
}

struct Inner<E: Entity> {
    store: Arc<EntityStore<E>>,
    remote: Arc<dyn RemoteApi<E>>,
    uploader: Option<Arc<dyn MediaUploader>>,
    cascades: Vec<Arc<dyn CascadeDelete>>,
    metrics: Option<Arc<SyncMetrics>>,
    in_flight: Mutex<HashMap<(EntityId, OpFamily), Slot>>,
}

/// Runs optimistic mutations against one store.
pub struct MutationCoordinator<E: Entity> {
    inner: Arc<Inner<E>>,
}

impl<E: Entity> Clone for MutationCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Collects a coordinator's collaborators before any clone can exist.
pub struct CoordinatorBuilder<E: Entity> {
    store: Arc<EntityStore<E>>,
    remote: Arc<dyn RemoteApi<E>>,
    uploader: Option<Arc<dyn MediaUploader>>,
    cascades: Vec<Arc<dyn CascadeDelete>>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl<E: Entity> CoordinatorBuilder<E> {
    /// Attach the uploader used for saves with a pending attachment.
    pub fn uploader(mut self, uploader: Arc<dyn MediaUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Delete children from `cascade` whenever a record here is deleted.
    pub fn cascade(mut self, cascade: Arc<dyn CascadeDelete>) -> Self {
        self.cascades.push(cascade);
        self
    }

    pub fn metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> MutationCoordinator<E> {
        MutationCoordinator {
            inner: Arc::new(Inner {
                store: self.store,
                remote: self.remote,
                uploader: self.uploader,
                cascades: self.cascades,
                metrics: self.metrics,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<E: Entity> MutationCoordinator<E> {
    pub fn new(store: Arc<EntityStore<E>>, remote: Arc<dyn RemoteApi<E>>) -> Self {
        Self::builder(store, remote).build()
    }

    pub fn builder(
        store: Arc<EntityStore<E>>,
        remote: Arc<dyn RemoteApi<E>>,
    ) -> CoordinatorBuilder<E> {
        CoordinatorBuilder {
            store,
            remote,
            uploader: None,
            cascades: Vec::new(),
            metrics: None,
        }
    }

    pub fn store(&self) -> &Arc<EntityStore<E>> {
        &self.inner.store
    }

    /// Run `mutation` against record `id`.
    ///
    /// Returns the server's record, or `None` for a delete. A save of a new
    /// record (id 0) is keyed by its own staged id, so unrelated new saves
    /// never supersede each other; its errors report that staged id.
    pub async fn mutate(
        &self,
        id: EntityId,
        mutation: Mutation<E>,
    ) -> Result<Option<E>, MutationError> {
        let operation = mutation.kind();
        if !operation.supported_by::<E>() {
            return Err(MutationError {
                kind: E::KIND,
                id,
                operation,
                source: SyncError::Unsupported {
                    kind: E::KIND,
                    operation,
                },
            });
        }

        let id = match &mutation {
            Mutation::Save { record, .. } if id == 0 && record.id() == 0 => new_staged_id(),
            _ => id,
        };
        let family = operation.family();
        let (lock, token, seq) = self.inner.claim(id, family);
        let caller_gone = token.clone().drop_guard();

        let inner = self.inner.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let _turn = lock.lock_owned().await;
            let result = inner.run(id, mutation, task_token).await;
            inner.release(id, family, seq);
            result
        });

        let joined = handle.await;
        caller_gone.disarm();
        joined.unwrap_or_else(|e| {
            Err(MutationError {
                kind: E::KIND,
                id,
                operation,
                source: SyncError::Storage(format!("mutation task failed: {e}")),
            })
        })
    }

    /// Cancel the in-flight mutation of `family` on `id`, if any.
    pub fn cancel(&self, id: EntityId, family: OpFamily) -> bool {
        let in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match in_flight.get(&(id, family)) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, id: EntityId, family: OpFamily) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(id, family))
    }
}

impl<E: Entity> Inner<E> {
    /// Take the `(id, family)` slot, cancelling whoever held it.
    fn claim(
        &self,
        id: EntityId,
        family: OpFamily,
    ) -> (Arc<tokio::sync::Mutex<()>>, CancellationToken, u64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = in_flight.entry((id, family)).or_insert_with(|| Slot {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            token: CancellationToken::new(),
            seq: 0,
        });
        if slot.seq > 0 {
            debug!(kind = %E::KIND, id, family = ?family, "Superseding in-flight mutation");
            slot.token.cancel();
        }
        slot.token = CancellationToken::new();
        slot.seq += 1;
        (slot.lock.clone(), slot.token.clone(), slot.seq)
    }

    fn release(&self, id: EntityId, family: OpFamily, seq: u64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(&(id, family)).is_some_and(|slot| slot.seq == seq) {
            in_flight.remove(&(id, family));
        }
    }

    async fn run(
        &self,
        id: EntityId,
        mutation: Mutation<E>,
        token: CancellationToken,
    ) -> Result<Option<E>, MutationError> {
        let operation = mutation.kind();
        let request_id = Uuid::new_v4();
        let fail = |source: SyncError| MutationError {
            kind: E::KIND,
            id,
            operation,
            source,
        };

        if token.is_cancelled() {
            self.record(operation, "cancelled");
            return Err(fail(SyncError::Cancelled));
        }

        let delta = self
            .store
            .transaction(|tx| LocalDelta::apply(tx, id, &mutation))
            .await
            .map_err(|e| {
                self.record(operation, "storage");
                fail(e.into())
            })?;
        debug!(%request_id, kind = %E::KIND, id, %operation, "Applied local delta");

        let answer = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            answer = self.call_remote(id, mutation) => answer,
        };

        let committed = match answer {
            Ok(answer) => self.commit(id, &delta, answer).await,
            Err(e) => Err(e),
        };

        match committed {
            Ok(record) => {
                self.record(operation, "success");
                info!(%request_id, kind = %E::KIND, id, %operation, "Mutation committed");
                Ok(record)
            }
            Err(source) => {
                self.rollback(&delta, operation).await;
                self.record(operation, source.label());
                warn!(%request_id, kind = %E::KIND, id, %operation, error = %source, "Mutation rolled back");
                Err(fail(source))
            }
        }
    }

    async fn call_remote(
        &self,
        id: EntityId,
        mutation: Mutation<E>,
    ) -> Result<RemoteAnswer<E>, SyncError> {
        let record = match mutation {
            Mutation::Like => self.remote.like(id).await?,
            Mutation::Unlike => self.remote.unlike(id).await?,
            Mutation::Participate => self.remote.participate(id).await?,
            Mutation::Unparticipate => self.remote.unparticipate(id).await?,
            Mutation::Delete => {
                self.remote.delete_by_id(id).await?;
                return Ok(RemoteAnswer::Deleted);
            }
            Mutation::Save {
                mut record,
                attachment,
            } => {
                if let Some(pending) = attachment {
                    let Some(uploader) = &self.uploader else {
                        return Err(SyncError::Unsupported {
                            kind: E::KIND,
                            operation: OperationKind::Save,
                        });
                    };
                    let uploaded = uploader.upload(&pending).await?;
                    record.set_attachment(Some(uploaded));
                }
                self.remote.save(record).await?
            }
        };
        Ok(RemoteAnswer::Record(record))
    }

    /// Write the server's answer over the local delta.
    async fn commit(
        &self,
        id: EntityId,
        delta: &LocalDelta<E>,
        answer: RemoteAnswer<E>,
    ) -> Result<Option<E>, SyncError> {
        match answer {
            RemoteAnswer::Record(mut record) => {
                let staged = delta.staged_id();
                if staged.is_some() {
                    record.set_visible(true);
                }
                let stored = self
                    .store
                    .transaction(|tx| {
                        if let Some(staged) = staged.filter(|&staged| staged != record.id()) {
                            tx.delete_by_id(staged);
                        }
                        let record_id = record.id();
                        tx.upsert(record)?;
                        Ok(tx.get(record_id).cloned())
                    })
                    .await?;
                Ok(stored)
            }
            RemoteAnswer::Deleted => {
                self.store.delete_by_id(id).await?;
                for cascade in &self.cascades {
                    let removed = cascade.delete_children(id).await?;
                    if removed > 0 {
                        debug!(kind = %E::KIND, id, removed, "Cascaded delete to children");
                    }
                }
                Ok(None)
            }
        }
    }

    async fn rollback(&self, delta: &LocalDelta<E>, operation: OperationKind) {
        if matches!(delta, LocalDelta::Nothing) {
            return;
        }
        if let Err(e) = self.store.transaction(|tx| delta.revert(tx)).await {
            error!(kind = %E::KIND, %operation, error = %e, "Failed to revert local delta");
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_rollback(E::KIND, operation);
        }
    }

    fn record(&self, operation: OperationKind, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_mutation(E::KIND, operation, outcome);
        }
    }
}
