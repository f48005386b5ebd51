//! Paged view: windowed, position-stable reads over an entity store.
//!
//! A [`Window`] is anchored on an ordering cursor, never on an array index,
//! so rows inserted above it do not shift what it shows. Windows recompute
//! whenever the store commits, the view is invalidated, or a load state
//! changes. Invalidations are level-triggered: several in a row collapse into
//! one recomputation.

use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entity::{Cursor, Direction, Entity};
use crate::error::SyncError;
use crate::paging::mediator::{LoadType, MediatorResult, PagingState, RemoteMediator};
use crate::store::EntityStore;

/// Progress of one kind of load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    NotLoading { end_of_pagination_reached: bool },
    Loading,
    Error(SyncError),
}

impl LoadState {
    pub fn is_end(&self) -> bool {
        matches!(
            self,
            LoadState::NotLoading {
                end_of_pagination_reached: true
            }
        )
    }
}

impl Default for LoadState {
    fn default() -> Self {
        LoadState::NotLoading {
            end_of_pagination_reached: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStates {
    pub refresh: LoadState,
    pub prepend: LoadState,
    pub append: LoadState,
}

impl LoadStates {
    pub fn get(&self, load_type: LoadType) -> &LoadState {
        match load_type {
            LoadType::Refresh => &self.refresh,
            LoadType::Prepend => &self.prepend,
            LoadType::Append => &self.append,
        }
    }

    fn set(&mut self, load_type: LoadType, state: LoadState) {
        match load_type {
            LoadType::Refresh => self.refresh = state,
            LoadType::Prepend => self.prepend = state,
            LoadType::Append => self.append = state,
        }
    }
}

/// One snapshot of a window.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<E> {
    pub items: Vec<E>,
    /// Visible rows ahead of the window's first item.
    pub items_before: usize,
    pub load_states: LoadStates,
    /// Invalidation epoch the snapshot was taken in.
    pub generation: u64,
}

struct ViewShared<E: Entity> {
    store: Arc<EntityStore<E>>,
    mediator: Option<Arc<RemoteMediator<E>>>,
    direction: Direction,
    invalidation: watch::Sender<u64>,
    load_states: watch::Sender<LoadStates>,
}

/// Factory for windows over one store. Cheap to clone.
pub struct PagedView<E: Entity> {
    shared: Arc<ViewShared<E>>,
}

impl<E: Entity> Clone for PagedView<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Entity> PagedView<E> {
    /// A view that only reads the local store.
    pub fn local(store: Arc<EntityStore<E>>, direction: Direction) -> Self {
        Self::build(store, None, direction)
    }

    /// A view backfilled from the network by `mediator`.
    pub fn mediated(store: Arc<EntityStore<E>>, mediator: Arc<RemoteMediator<E>>) -> Self {
        let direction = mediator.direction();
        Self::build(store, Some(mediator), direction)
    }

    fn build(
        store: Arc<EntityStore<E>>,
        mediator: Option<Arc<RemoteMediator<E>>>,
        direction: Direction,
    ) -> Self {
        let (invalidation, _) = watch::channel(0);
        let (load_states, _) = watch::channel(LoadStates::default());
        Self {
            shared: Arc::new(ViewShared {
                store,
                mediator,
                direction,
                invalidation,
                load_states,
            }),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore<E>> {
        &self.shared.store
    }

    pub fn load_states(&self) -> LoadStates {
        self.shared.load_states.borrow().clone()
    }

    /// Force every open window to recompute.
    pub fn invalidate(&self) {
        self.shared.invalidation.send_modify(|epoch| *epoch += 1);
        debug!(kind = %E::KIND, epoch = *self.shared.invalidation.borrow(), "Invalidated view");
    }

    pub fn open_window(&self, page_size: usize, initial_load_size: usize) -> Window<E> {
        let page_size = page_size.max(1);
        let initial_load_size = initial_load_size.max(page_size);
        let store_rx = self.shared.store.subscribe();
        let invalidation_rx = self.shared.invalidation.subscribe();
        let states_rx = self.shared.load_states.subscribe();

        Window {
            view: self.clone(),
            anchor: None,
            span: initial_load_size,
            page_size,
            initial_load_size,
            store_rx,
            invalidation_rx,
            states_rx,
            last_failed: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Run a mediator load and publish its state to every window.
    ///
    /// Returns `None` for a local-only view.
    pub async fn load(
        &self,
        load_type: LoadType,
        state: PagingState,
        cancel: &CancellationToken,
    ) -> Result<Option<MediatorResult>, SyncError> {
        let Some(mediator) = &self.shared.mediator else {
            return Ok(None);
        };
        self.shared
            .load_states
            .send_modify(|states| states.set(load_type, LoadState::Loading));

        let result = mediator.load(load_type, state, cancel).await;
        self.shared.load_states.send_modify(|states| match &result {
            Ok(MediatorResult::Success {
                end_of_pagination_reached,
            }) => {
                states.set(
                    load_type,
                    LoadState::NotLoading {
                        end_of_pagination_reached: *end_of_pagination_reached,
                    },
                );
                if load_type == LoadType::Refresh {
                    states.append = LoadState::default();
                }
            }
            Ok(MediatorResult::Error(e)) | Err(e) => {
                states.set(load_type, LoadState::Error(e.clone()))
            }
        });
        result.map(Some)
    }
}

/// A live, position-stable window over a [`PagedView`].
pub struct Window<E: Entity> {
    view: PagedView<E>,
    /// First row of the window; `None` follows the head of the order.
    anchor: Option<Cursor>,
    /// Rows shown from the anchor.
    span: usize,
    page_size: usize,
    initial_load_size: usize,
    store_rx: watch::Receiver<u64>,
    invalidation_rx: watch::Receiver<u64>,
    states_rx: watch::Receiver<LoadStates>,
    last_failed: Option<LoadType>,
    cancel: CancellationToken,
}

impl<E: Entity> Window<E> {
    fn direction(&self) -> Direction {
        self.view.shared.direction
    }

    fn store(&self) -> &EntityStore<E> {
        &self.view.shared.store
    }

    pub fn anchor(&self) -> Option<Cursor> {
        self.anchor
    }

    pub fn span(&self) -> usize {
        self.span
    }

    /// Cancel loads started by this window when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current contents of the window.
    pub async fn snapshot(&self) -> Page<E> {
        let from = self.anchor.map_or(Bound::Unbounded, Bound::Included);
        let items = self.store().scan(from, self.span, self.direction()).await;
        let items_before = match self.anchor {
            Some(anchor) => self.store().count_before(anchor, self.direction()).await,
            None => 0,
        };
        Page {
            items,
            items_before,
            load_states: self.states_rx.borrow().clone(),
            generation: *self.invalidation_rx.borrow(),
        }
    }

    /// Wait until the window's contents may have changed.
    ///
    /// Returns false once the underlying channels are gone.
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            changed = self.store_rx.changed() => changed.is_ok(),
            changed = self.states_rx.changed() => changed.is_ok(),
            changed = self.invalidation_rx.changed() => {
                self.span = self.span.max(self.initial_load_size);
                changed.is_ok()
            }
        }
    }

    fn paging_state(&self, page: &Page<E>) -> PagingState {
        PagingState {
            first: page.items.first().map(Cursor::of),
            last: page.items.last().map(Cursor::of),
            page_size: self.page_size,
            initial_load_size: self.initial_load_size,
        }
    }

    async fn load(&mut self, load_type: LoadType) -> Result<(), SyncError> {
        let page = self.snapshot().await;
        let state = self.paging_state(&page);
        let result = self.view.load(load_type, state, &self.cancel).await?;
        self.last_failed = match result {
            Some(MediatorResult::Error(_)) => Some(load_type),
            _ => None,
        };
        Ok(())
    }

    /// Extend the window by one page, asking the remote for older rows when
    /// the local store runs out.
    pub async fn load_more(&mut self) -> Result<(), SyncError> {
        self.span += self.page_size;
        let shown = self.snapshot().await.items.len();
        if shown < self.span && !self.view.load_states().append.is_end() {
            self.load(LoadType::Append).await?;
        }
        Ok(())
    }

    /// Extend the window one page towards the head.
    pub async fn load_newer(&mut self) -> Result<(), SyncError> {
        if self.shift_towards_head().await > 0 {
            return Ok(());
        }
        self.load(LoadType::Prepend).await?;
        self.shift_towards_head().await;
        Ok(())
    }

    /// Move the anchor up to `page_size` rows towards the head.
    async fn shift_towards_head(&mut self) -> usize {
        let Some(anchor) = self.anchor else {
            return 0;
        };
        let towards_head = match self.direction() {
            Direction::Descending => Direction::Ascending,
            Direction::Ascending => Direction::Descending,
        };
        let ahead = self
            .store()
            .scan(Bound::Excluded(anchor), self.page_size, towards_head)
            .await;
        let Some(newest) = ahead.last() else {
            return 0;
        };
        let new_anchor = Cursor::of(newest);
        self.span += ahead.len();
        self.anchor = if self.store().count_before(new_anchor, self.direction()).await == 0 {
            None
        } else {
            Some(new_anchor)
        };
        ahead.len()
    }

    /// REFRESH from the remote and return to the head.
    pub async fn refresh(&mut self) -> Result<(), SyncError> {
        self.load(LoadType::Refresh).await?;
        if self.last_failed.is_none() {
            self.anchor = None;
            self.span = self.span.max(self.initial_load_size);
        }
        Ok(())
    }

    /// Re-run the last failed load, if any.
    pub async fn retry(&mut self) -> Result<bool, SyncError> {
        let Some(load_type) = self.last_failed else {
            return Ok(false);
        };
        match load_type {
            LoadType::Refresh => self.refresh().await?,
            LoadType::Append => self.load(LoadType::Append).await?,
            LoadType::Prepend => self.load_newer().await?,
        }
        Ok(true)
    }

    /// Pin the window's first row to `cursor`.
    pub fn anchor_at(&mut self, cursor: Cursor) {
        self.anchor = Some(cursor);
    }

    /// Follow the head of the order again.
    pub fn anchor_top(&mut self) {
        self.anchor = None;
    }

    /// Token cancelling this window's loads.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, Post};

    fn post(id: EntityId) -> Post {
        let mut post = Post::draft(1, format!("post {id}"));
        post.id = id;
        post
    }

    fn ids(page: &Page<Post>) -> Vec<EntityId> {
        page.items.iter().map(|p| p.id).collect()
    }

    async fn local_view(n: EntityId) -> PagedView<Post> {
        let store = Arc::new(EntityStore::in_memory());
        store.upsert_many((1..=n).map(post).collect()).await.unwrap();
        PagedView::local(store, Direction::Descending)
    }

    #[tokio::test]
    async fn test_window_grows_by_page() {
        let view = local_view(10).await;
        let mut window = view.open_window(2, 3);
        assert_eq!(ids(&window.snapshot().await), vec![10, 9, 8]);

        window.load_more().await.unwrap();
        assert_eq!(ids(&window.snapshot().await), vec![10, 9, 8, 7, 6]);
    }

    #[tokio::test]
    async fn test_anchor_is_position_stable() {
        let view = local_view(10).await;
        let mut window = view.open_window(2, 3);
        window.anchor_at(Cursor::new(7, 7));

        view.store().upsert(post(11)).await.unwrap();
        let page = window.snapshot().await;
        assert_eq!(ids(&page), vec![7, 6, 5]);
        assert_eq!(page.items_before, 4);

        window.load_newer().await.unwrap();
        let page = window.snapshot().await;
        assert_eq!(ids(&page), vec![9, 8, 7, 6, 5]);
        assert_eq!(page.items_before, 2);

        window.load_newer().await.unwrap();
        assert_eq!(window.anchor(), None);
        assert_eq!(window.snapshot().await.items[0].id, 11);
    }

    #[tokio::test]
    async fn test_store_commit_wakes_window() {
        let view = local_view(3).await;
        let mut window = view.open_window(2, 3);
        view.store().upsert(post(4)).await.unwrap();
        assert!(window.changed().await);
        assert_eq!(ids(&window.snapshot().await), vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn test_invalidations_collapse() {
        let view = local_view(3).await;
        let mut window = view.open_window(2, 2);
        view.invalidate();
        view.invalidate();
        assert!(window.changed().await);
        assert_eq!(window.snapshot().await.generation, 2);

        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), window.changed());
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn test_hidden_rows_stay_out_of_window() {
        let view = local_view(3).await;
        let mut hidden = post(4);
        hidden.visible = false;
        view.store().upsert(hidden).await.unwrap();

        let window = view.open_window(2, 5);
        assert_eq!(ids(&window.snapshot().await), vec![3, 2, 1]);
    }
}
