//! Remote mediator: decides how a page window is backfilled from the network.
//!
//! - REFRESH replaces the whole local set with the newest page
//! - APPEND fetches the page older than the last loaded record
//! - PREPEND is either terminal (feeds) or fetches the page newer than the
//!   first loaded record (walls, timelines)
//!
//! Remote failures become [`MediatorResult::Error`] so the window can offer a
//! retry. Storage failures are returned as `Err` and are fatal. Cancellation
//! is benign and reported as the end of pagination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entity::{Cursor, Direction, Entity, UserPreview};
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::remote::RemoteApi;
use crate::store::EntityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadType {
    Refresh,
    Prepend,
    Append,
}

impl LoadType {
    pub fn label(&self) -> &'static str {
        match self {
            LoadType::Refresh => "refresh",
            LoadType::Prepend => "prepend",
            LoadType::Append => "append",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediatorResult {
    Success { end_of_pagination_reached: bool },
    Error(SyncError),
}

impl MediatorResult {
    fn success(end_of_pagination_reached: bool) -> Self {
        MediatorResult::Success {
            end_of_pagination_reached,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            MediatorResult::Success { .. } => "success",
            MediatorResult::Error(_) => "error",
        }
    }
}

/// What the requesting window currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingState {
    /// First loaded record, if any.
    pub first: Option<Cursor>,
    /// Last loaded record, if any.
    pub last: Option<Cursor>,
    pub page_size: usize,
    pub initial_load_size: usize,
}

/// PREPEND behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrependMode {
    /// Nothing newer is fetched on demand; new items arrive via REFRESH or the
    /// newer-items watch.
    #[default]
    Terminal,
    /// Fetch the page after the first loaded record.
    FetchAfter,
}

/// Outcome of the latest completed REFRESH, shared with coalesced callers.
#[derive(Default)]
struct LastRefresh {
    result: Option<MediatorResult>,
}

pub struct RemoteMediator<E: Entity> {
    store: Arc<EntityStore<E>>,
    remote: Arc<dyn RemoteApi<E>>,
    previews: Option<Arc<EntityStore<UserPreview>>>,
    prepend: PrependMode,
    direction: Direction,
    metrics: Option<Arc<SyncMetrics>>,

    /// Serializes REFRESH and holds its last result.
    refresh: Mutex<LastRefresh>,

    /// Completed REFRESH count.
    refreshes: AtomicU64,
}

impl<E: Entity> RemoteMediator<E> {
    pub fn new(store: Arc<EntityStore<E>>, remote: Arc<dyn RemoteApi<E>>) -> Self {
        Self {
            store,
            remote,
            previews: None,
            prepend: PrependMode::default(),
            direction: Direction::Descending,
            metrics: None,
            refresh: Mutex::new(LastRefresh::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn with_prepend(mut self, mode: PrependMode) -> Self {
        self.prepend = mode;
        self
    }

    pub fn with_previews(mut self, previews: Arc<EntityStore<UserPreview>>) -> Self {
        self.previews = Some(previews);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Number of REFRESH loads that reached the store.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Acquire)
    }

    pub async fn load(
        &self,
        load_type: LoadType,
        state: PagingState,
        cancel: &CancellationToken,
    ) -> Result<MediatorResult, SyncError> {
        let result = match load_type {
            LoadType::Refresh => self.refresh(state, cancel).await,
            LoadType::Append => self.append(state, cancel).await,
            LoadType::Prepend => self.prepend(state, cancel).await,
        };

        let outcome = match &result {
            Ok(result) => result.outcome(),
            Err(_) => "fatal",
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_load(E::KIND, load_type.label(), outcome);
        }
        match &result {
            Ok(MediatorResult::Error(e)) => {
                warn!(kind = %E::KIND, load = load_type.label(), error = %e, "Remote load failed")
            }
            Err(e) => warn!(kind = %E::KIND, load = load_type.label(), error = %e, "Load aborted"),
            Ok(_) => {}
        }
        result
    }

    async fn refresh(
        &self,
        state: PagingState,
        cancel: &CancellationToken,
    ) -> Result<MediatorResult, SyncError> {
        let seen = self.refreshes.load(Ordering::Acquire);
        let mut last = self.refresh.lock().await;
        if self.refreshes.load(Ordering::Acquire) != seen {
            if let Some(result) = &last.result {
                debug!(kind = %E::KIND, "Joined a concurrent refresh");
                return Ok(result.clone());
            }
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(MediatorResult::success(true)),
            fetched = self.remote.get_latest(state.initial_load_size) => fetched,
        };
        let rows = match fetched.and_then(require_ids) {
            Ok(rows) => rows,
            Err(e) => {
                let result = MediatorResult::Error(e);
                last.result = Some(result.clone());
                self.refreshes.fetch_add(1, Ordering::AcqRel);
                return Ok(result);
            }
        };

        let count = rows.len();
        self.store_previews(&rows).await?;
        self.store
            .transaction(|tx| {
                tx.clear();
                tx.upsert_many(rows)
            })
            .await?;

        info!(kind = %E::KIND, rows = count, "Refreshed from remote");
        let result = MediatorResult::success(count == 0);
        last.result = Some(result.clone());
        self.refreshes.fetch_add(1, Ordering::AcqRel);
        Ok(result)
    }

    async fn append(
        &self,
        state: PagingState,
        cancel: &CancellationToken,
    ) -> Result<MediatorResult, SyncError> {
        let cursor = match state.last {
            Some(cursor) => Some(cursor),
            None => self.store.last_cursor(self.direction).await,
        };
        let Some(cursor) = cursor else {
            return Ok(MediatorResult::success(true));
        };

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(MediatorResult::success(true)),
            fetched = self.remote.get_before(cursor.id, state.page_size) => fetched,
        };
        self.merge(fetched, LoadType::Append).await
    }

    async fn prepend(
        &self,
        state: PagingState,
        cancel: &CancellationToken,
    ) -> Result<MediatorResult, SyncError> {
        if self.prepend == PrependMode::Terminal {
            return Ok(MediatorResult::success(true));
        }
        let cursor = match state.first {
            Some(cursor) => Some(cursor),
            None => self.store.first_cursor(self.direction).await,
        };
        let Some(cursor) = cursor else {
            return Ok(MediatorResult::success(true));
        };

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(MediatorResult::success(true)),
            fetched = self.remote.get_after(cursor.id, state.page_size) => fetched,
        };
        self.merge(fetched, LoadType::Prepend).await
    }

    /// Upsert a fetched page. An empty page ends pagination in that direction.
    async fn merge(
        &self,
        fetched: Result<Vec<E>, SyncError>,
        load_type: LoadType,
    ) -> Result<MediatorResult, SyncError> {
        let rows = match fetched.and_then(require_ids) {
            Ok(rows) => rows,
            Err(e) => return Ok(MediatorResult::Error(e)),
        };
        if rows.is_empty() {
            return Ok(MediatorResult::success(true));
        }

        let count = rows.len();
        self.store_previews(&rows).await?;
        self.store.upsert_many(rows).await?;
        debug!(kind = %E::KIND, load = load_type.label(), rows = count, "Merged page");
        Ok(MediatorResult::success(false))
    }

    async fn store_previews(&self, rows: &[E]) -> Result<(), SyncError> {
        let Some(previews) = &self.previews else {
            return Ok(());
        };
        let authors: Vec<UserPreview> = rows
            .iter()
            .filter_map(Entity::author_preview)
            .filter(|author| author.id() != 0)
            .collect();
        if !authors.is_empty() {
            previews.upsert_many(authors).await?;
        }
        Ok(())
    }
}

/// A fetched record without a server id is a bad payload, not a local fault.
fn require_ids<E: Entity>(rows: Vec<E>) -> Result<Vec<E>, SyncError> {
    match rows.iter().position(|row| row.id() == 0) {
        Some(index) => Err(SyncError::RemoteRejected {
            status: 200,
            message: format!("{} at position {index} has no id", E::KIND),
        }),
        None => Ok(rows),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, Post};
    use crate::remote::fake::{CallKind, ScriptedRemote};

    fn post(id: EntityId) -> Post {
        let mut post = Post::draft(100 + id, format!("post {id}"));
        post.id = id;
        post.author = format!("author {id}");
        post
    }

    fn state(page_size: usize, initial_load_size: usize) -> PagingState {
        PagingState {
            first: None,
            last: None,
            page_size,
            initial_load_size,
        }
    }

    #[tokio::test]
    async fn test_refresh_replaces_and_stores_previews() {
        let store = Arc::new(EntityStore::in_memory());
        store.upsert(post(99)).await.unwrap();
        let previews = Arc::new(EntityStore::in_memory());
        let remote = Arc::new(ScriptedRemote::new().with_records((1..=5).map(post)));
        let mediator =
            RemoteMediator::new(store.clone(), remote.clone()).with_previews(previews.clone());

        let result = mediator
            .load(LoadType::Refresh, state(2, 3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, MediatorResult::success(false));
        assert!(!store.contains(99).await);
        assert_eq!(store.len().await, 3);
        assert_eq!(previews.len().await, 3);
        assert_eq!(mediator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_prepend_skips_network() {
        let store = Arc::new(EntityStore::<Post>::in_memory());
        let remote = Arc::new(ScriptedRemote::new());
        let mediator = RemoteMediator::new(store, remote.clone());
        let result = mediator
            .load(LoadType::Prepend, state(2, 3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, MediatorResult::success(true));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_append_failure_is_reported_not_fatal() {
        let store = Arc::new(EntityStore::in_memory());
        store.upsert(post(5)).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new().with_records((1..=5).map(post)));
        remote.fail_next(CallKind::Before, SyncError::Network("offline".into()));
        let mediator = RemoteMediator::new(store.clone(), remote);

        let result = mediator
            .load(LoadType::Append, state(2, 3), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(result, MediatorResult::Error(SyncError::Network(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_record_without_id_is_rejected_not_fatal() {
        let store = Arc::new(EntityStore::in_memory());
        store.upsert(post(99)).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new().with_records((1..=3).map(post)));
        remote.seed([Post::draft(7, "never saved")]);
        let mediator = RemoteMediator::new(store.clone(), remote);

        let result = mediator
            .load(LoadType::Refresh, state(2, 10), &CancellationToken::new())
            .await
            .unwrap();
        match result {
            MediatorResult::Error(SyncError::RemoteRejected { status, .. }) => {
                assert_eq!(status, 200)
            }
            other => panic!("expected a rejected payload, got {other:?}"),
        }
        assert_eq!(store.len().await, 1);
        assert!(store.contains(99).await);

        let result = mediator
            .load(LoadType::Append, state(10, 10), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(result, MediatorResult::Error(SyncError::RemoteRejected { .. })));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_load_is_benign() {
        let store = Arc::new(EntityStore::<Post>::in_memory());
        let remote = Arc::new(ScriptedRemote::new().with_records((1..=5).map(post)));
        let mediator = RemoteMediator::new(store.clone(), remote);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = mediator
            .load(LoadType::Refresh, state(2, 3), &cancel)
            .await
            .unwrap();
        assert_eq!(result, MediatorResult::success(true));
        assert!(store.is_empty().await);
    }
}
