//! Repository facade: one entry point per entity kind.
//!
//! A [`Repository`] wires a store, a remote, a mediator-backed view and a
//! mutation coordinator together and exposes reads, window streams and
//! optimistic mutations. Construct it with [`RepositoryBuilder`].

pub mod newer;

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthContext;
use crate::config::PagingConfig;
use crate::entity::{Direction, Entity, EntityId, UserPreview};
use crate::error::{MutationError, SyncError};
use crate::metrics::SyncMetrics;
use crate::mutation::{CascadeDelete, Mutation, MutationCoordinator, PendingAttachment};
use crate::paging::{
    LoadType, MediatorResult, Page, PagedView, PagingState, PrependMode, RemoteMediator, Window,
};
use crate::remote::{MediaUploader, RemoteApi};
use crate::store::EntityStore;

pub use newer::NewerWatch;

pub struct RepositoryBuilder<E: Entity> {
    store: Arc<EntityStore<E>>,
    remote: Arc<dyn RemoteApi<E>>,
    paging: PagingConfig,
    direction: Direction,
    prepend: PrependMode,
    previews: Option<Arc<EntityStore<UserPreview>>>,
    uploader: Option<Arc<dyn MediaUploader>>,
    cascades: Vec<Arc<dyn CascadeDelete>>,
    metrics: Option<Arc<SyncMetrics>>,
    newer_interval: Option<Duration>,
}

impl<E: Entity> RepositoryBuilder<E> {
    pub fn paging(mut self, paging: PagingConfig) -> Self {
        self.paging = paging;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn prepend(mut self, mode: PrependMode) -> Self {
        self.prepend = mode;
        self
    }

    pub fn previews(mut self, previews: Arc<EntityStore<UserPreview>>) -> Self {
        self.previews = Some(previews);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn MediaUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Remove children in `cascade` when a record of this kind is deleted.
    pub fn cascade(mut self, cascade: Arc<dyn CascadeDelete>) -> Self {
        self.cascades.push(cascade);
        self
    }

    pub fn metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enable the newer-items watch.
    pub fn newer_every(mut self, interval: Duration) -> Self {
        self.newer_interval = Some(interval);
        self
    }

    pub fn build(self) -> Repository<E> {
        let mut mediator = RemoteMediator::new(self.store.clone(), self.remote.clone())
            .with_prepend(self.prepend)
            .with_direction(self.direction);
        if let Some(previews) = self.previews {
            mediator = mediator.with_previews(previews);
        }
        let mut coordinator = MutationCoordinator::builder(self.store.clone(), self.remote.clone());
        if let Some(uploader) = self.uploader {
            coordinator = coordinator.uploader(uploader);
        }
        for cascade in self.cascades {
            coordinator = coordinator.cascade(cascade);
        }
        if let Some(metrics) = &self.metrics {
            mediator = mediator.with_metrics(metrics.clone());
            coordinator = coordinator.metrics(metrics.clone());
        }
        let coordinator = coordinator.build();

        let view = PagedView::mediated(self.store.clone(), Arc::new(mediator));
        let newer = self.newer_interval.map(|interval| {
            let mut watch = NewerWatch::new(view.clone(), self.remote.clone(), interval);
            if let Some(metrics) = &self.metrics {
                watch = watch.with_metrics(metrics.clone());
            }
            Arc::new(watch)
        });

        Repository {
            store: self.store,
            remote: self.remote,
            view,
            coordinator,
            newer,
            paging: self.paging,
        }
    }
}

pub struct Repository<E: Entity> {
    store: Arc<EntityStore<E>>,
    remote: Arc<dyn RemoteApi<E>>,
    view: PagedView<E>,
    coordinator: MutationCoordinator<E>,
    newer: Option<Arc<NewerWatch<E>>>,
    paging: PagingConfig,
}

impl<E: Entity> Repository<E> {
    pub fn builder(store: Arc<EntityStore<E>>, remote: Arc<dyn RemoteApi<E>>) -> RepositoryBuilder<E> {
        RepositoryBuilder {
            store,
            remote,
            paging: PagingConfig::default(),
            direction: Direction::Descending,
            prepend: PrependMode::Terminal,
            previews: None,
            uploader: None,
            cascades: Vec::new(),
            metrics: None,
            newer_interval: None,
        }
    }

    pub fn store(&self) -> &Arc<EntityStore<E>> {
        &self.store
    }

    pub fn view(&self) -> &PagedView<E> {
        &self.view
    }

    pub fn coordinator(&self) -> &MutationCoordinator<E> {
        &self.coordinator
    }

    /// Cached record, if any.
    pub async fn get(&self, id: EntityId) -> Option<E> {
        self.store.get(id).await
    }

    /// Point refresh from the remote.
    ///
    /// A record the server no longer has is evicted and reported as `None`.
    pub async fn fetch(&self, id: EntityId) -> Result<Option<E>, SyncError> {
        match self.remote.get_by_id(id).await {
            Ok(record) => {
                self.store.upsert(record).await?;
                Ok(self.store.get(id).await)
            }
            Err(SyncError::NotFound { .. }) => {
                if self.store.delete_by_id(id).await?.is_some() {
                    info!(kind = %E::KIND, id, "Evicted record gone from remote");
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn open_window(&self) -> Window<E> {
        self.view
            .open_window(self.paging.page_size, self.paging.initial_load_size)
    }

    /// Stream of window snapshots, refreshing from the remote on open when
    /// configured to.
    pub fn stream(&self, cancel: CancellationToken) -> impl Stream<Item = Page<E>> + Send {
        if self.paging.refresh_on_open {
            let view = self.view.clone();
            let newer = self.newer.clone();
            let state = self.initial_state();
            let token = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = view.load(LoadType::Refresh, state, &token).await {
                    warn!(kind = %E::KIND, error = %e, "Refresh on open failed");
                }
                if let Some(newer) = newer {
                    newer.resync().await;
                }
            });
        }
        self.open_window().into_stream(cancel)
    }

    fn initial_state(&self) -> PagingState {
        PagingState {
            first: None,
            last: None,
            page_size: self.paging.page_size,
            initial_load_size: self.paging.initial_load_size,
        }
    }

    /// REFRESH from the remote, replacing the cached set. Staged newer items
    /// go with it, so the newer count is republished.
    pub async fn refresh(&self) -> Result<MediatorResult, SyncError> {
        let result = self
            .view
            .load(LoadType::Refresh, self.initial_state(), &CancellationToken::new())
            .await?;
        if let Some(newer) = &self.newer {
            newer.resync().await;
        }
        Ok(result.unwrap_or(MediatorResult::Success {
            end_of_pagination_reached: true,
        }))
    }

    pub async fn like(&self, id: EntityId) -> Result<Option<E>, MutationError> {
        self.coordinator.mutate(id, Mutation::Like).await
    }

    pub async fn unlike(&self, id: EntityId) -> Result<Option<E>, MutationError> {
        self.coordinator.mutate(id, Mutation::Unlike).await
    }

    /// Like or unlike depending on the cached "liked by me" state.
    pub async fn toggle_like(&self, id: EntityId) -> Result<Option<E>, MutationError> {
        let liked = match (self.store.viewer().await, self.store.get(id).await) {
            (Some(viewer), Some(record)) => record
                .members(crate::entity::SetField::LikeOwners)
                .is_some_and(|likers| likers.contains(&viewer)),
            _ => false,
        };
        if liked {
            self.unlike(id).await
        } else {
            self.like(id).await
        }
    }

    pub async fn participate(&self, id: EntityId) -> Result<Option<E>, MutationError> {
        self.coordinator.mutate(id, Mutation::Participate).await
    }

    pub async fn unparticipate(&self, id: EntityId) -> Result<Option<E>, MutationError> {
        self.coordinator.mutate(id, Mutation::Unparticipate).await
    }

    pub async fn delete(&self, id: EntityId) -> Result<(), MutationError> {
        self.coordinator.mutate(id, Mutation::Delete).await.map(|_| ())
    }

    /// Create (id 0) or update a record, uploading `attachment` first.
    pub async fn save(
        &self,
        record: E,
        attachment: Option<PendingAttachment>,
    ) -> Result<Option<E>, MutationError> {
        let id = record.id();
        self.coordinator
            .mutate(id, Mutation::Save { record, attachment })
            .await
    }

    /// Hidden newer items waiting to be shown.
    pub fn newer_count(&self) -> usize {
        self.newer.as_ref().map_or(0, |newer| newer.count())
    }

    pub fn newer(&self) -> Option<&Arc<NewerWatch<E>>> {
        self.newer.as_ref()
    }

    pub async fn show_new(&self) -> Result<usize, SyncError> {
        match &self.newer {
            Some(newer) => newer.show_new().await,
            None => Ok(0),
        }
    }

    /// Start the newer-items watch, if enabled.
    pub fn spawn_newer(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.newer.as_ref().map(|newer| newer.clone().spawn(cancel))
    }

    /// Keep the store's viewer in step with `auth` until `cancel` fires.
    ///
    /// Every change recomputes the "by me" flags and invalidates open windows.
    pub fn watch_auth(
        &self,
        auth: Arc<dyn AuthContext>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let view = self.view.clone();
        let mut rx = auth.subscribe();
        tokio::spawn(async move {
            loop {
                let viewer = rx.borrow_and_update().user_id;
                if store.viewer().await != viewer {
                    match store.set_viewer(viewer).await {
                        Ok(()) => {
                            debug!(kind = %E::KIND, ?viewer, "Viewer changed");
                            view.invalidate();
                        }
                        Err(e) => warn!(kind = %E::KIND, error = %e, "Failed to switch viewer"),
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => if changed.is_err() { break },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedAuth;
    use crate::entity::Post;
    use crate::remote::fake::ScriptedRemote;

    fn post(id: EntityId, likers: &[i64]) -> Post {
        let mut post = Post::draft(1, format!("post {id}"));
        post.id = id;
        post.like_owner_ids = likers.iter().copied().collect();
        post
    }

    #[tokio::test]
    async fn test_fetch_evicts_gone_record() {
        let store = Arc::new(EntityStore::in_memory());
        store.upsert(post(1, &[])).await.unwrap();
        let remote = Arc::new(ScriptedRemote::<Post>::new());
        let repo = Repository::builder(store.clone(), remote).build();

        assert_eq!(repo.fetch(1).await.unwrap(), None);
        assert!(store.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_toggle_like_follows_cached_state() {
        let store = Arc::new(EntityStore::in_memory());
        store.set_viewer(Some(5)).await.unwrap();
        store.upsert(post(1, &[5])).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new().with_user(5).with_records([post(1, &[5])]));
        let repo = Repository::builder(store.clone(), remote).build();

        let record = repo.toggle_like(1).await.unwrap().unwrap();
        assert!(!record.liked_by_me);
        let record = repo.toggle_like(1).await.unwrap().unwrap();
        assert!(record.liked_by_me);
    }

    #[tokio::test]
    async fn test_auth_change_recomputes_flags() {
        let store = Arc::new(EntityStore::in_memory());
        store.upsert(post(1, &[9])).await.unwrap();
        let repo = Repository::builder(store.clone(), Arc::new(ScriptedRemote::new())).build();
        let auth = Arc::new(SharedAuth::anonymous());
        let cancel = CancellationToken::new();
        let mut version = store.subscribe();

        let handle = repo.watch_auth(auth.clone(), cancel.clone());
        auth.login(9, "token");
        version.changed().await.unwrap();
        assert!(store.get(1).await.unwrap().liked_by_me);

        cancel.cancel();
        handle.await.unwrap();
    }
}
