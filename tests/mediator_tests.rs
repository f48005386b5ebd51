//! Integration tests for remote mediation and windowed paging.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use feed_sync::config::PagingConfig;
use feed_sync::entity::{Cursor, Direction, EntityId, Post};
use feed_sync::error::SyncError;
use feed_sync::paging::{
    LoadState, LoadType, MediatorResult, PagedView, PagingState, PrependMode, RemoteMediator,
};
use feed_sync::remote::fake::{CallKind, ScriptedRemote};
use feed_sync::repository::Repository;
use feed_sync::store::EntityStore;

fn post(id: EntityId) -> Post {
    let mut post = Post::draft(1, format!("post {id}"));
    post.id = id;
    post
}

fn ids(rows: &[Post]) -> Vec<EntityId> {
    rows.iter().map(|p| p.id).collect()
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
async fn test_refresh_fills_empty_store() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=25).map(post)));
    let mediator = RemoteMediator::new(store.clone(), remote);

    let result = mediator
        .load(LoadType::Refresh, state(10, 10), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        result,
        MediatorResult::Success {
            end_of_pagination_reached: false
        }
    );
    let rows = store.scan_ordered(None, 100, Direction::Descending).await;
    assert_eq!(ids(&rows), (16..=25).rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_empty_append_ends_pagination() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    store.upsert_many((1..=3).map(post).collect()).await.unwrap();
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=3).map(post)));
    let mediator = RemoteMediator::new(store.clone(), remote.clone());
    let version = store.version();

    let mut paging = state(10, 10);
    paging.last = Some(Cursor::new(1, 1));
    let result = mediator
        .load(LoadType::Append, paging, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        result,
        MediatorResult::Success {
            end_of_pagination_reached: true
        }
    );
    assert_eq!(store.version(), version);
    assert_eq!(store.len().await, 3);
    assert_eq!(remote.calls()[0].id, Some(1));
}

#[tokio::test]
async fn test_append_walks_back_to_the_oldest_record() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=23).map(post)));
    let mediator = Arc::new(RemoteMediator::new(store.clone(), remote.clone()));
    let view = PagedView::mediated(store.clone(), mediator);

    let mut window = view.open_window(10, 10);
    window.refresh().await.unwrap();
    assert_eq!(window.snapshot().await.items.len(), 10);

    window.load_more().await.unwrap();
    window.load_more().await.unwrap();
    let page = window.snapshot().await;
    assert_eq!(page.items.len(), 23);
    assert_eq!(page.items.last().map(|p| p.id), Some(1));
    assert!(!page.load_states.append.is_end());

    window.load_more().await.unwrap();
    assert!(view.load_states().append.is_end());
    assert_eq!(remote.count(CallKind::Before), 3);

    // Nothing more to fetch once the end is known.
    window.load_more().await.unwrap();
    assert_eq!(remote.count(CallKind::Before), 3);
}

#[tokio::test]
async fn test_prepend_modes() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    store.upsert_many((1..=5).map(post).collect()).await.unwrap();
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=8).map(post)));

    let terminal = RemoteMediator::new(store.clone(), remote.clone());
    let result = terminal
        .load(LoadType::Prepend, state(10, 10), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        result,
        MediatorResult::Success {
            end_of_pagination_reached: true
        }
    ));
    assert_eq!(remote.count(CallKind::After), 0);

    let wall = RemoteMediator::new(store.clone(), remote.clone()).with_prepend(PrependMode::FetchAfter);
    let result = wall
        .load(LoadType::Prepend, state(2, 10), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        result,
        MediatorResult::Success {
            end_of_pagination_reached: false
        }
    ));
    assert_eq!(remote.calls()[0].id, Some(5));
    let rows = store.scan_ordered(None, 100, Direction::Descending).await;
    assert_eq!(ids(&rows), vec![7, 6, 5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn test_failed_load_can_be_retried() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=5).map(post)));
    remote.fail_next(CallKind::Latest, SyncError::Network("timeout".into()));
    let mediator = Arc::new(RemoteMediator::new(store.clone(), remote.clone()));
    let view = PagedView::mediated(store.clone(), mediator);
    let mut window = view.open_window(10, 10);

    window.refresh().await.unwrap();
    match &window.snapshot().await.load_states.refresh {
        LoadState::Error(e) => assert!(e.is_retryable()),
        other => panic!("expected an error state, got {other:?}"),
    }
    assert!(store.is_empty().await);

    assert!(window.retry().await.unwrap());
    let page = window.snapshot().await;
    assert_eq!(ids(&page.items), vec![5, 4, 3, 2, 1]);
    assert!(matches!(page.load_states.refresh, LoadState::NotLoading { .. }));
    assert!(!window.retry().await.unwrap());
}

#[tokio::test]
async fn test_cancelled_refresh_leaves_store_untouched() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    store.upsert(post(100)).await.unwrap();
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=5).map(post)));
    remote.hold(CallKind::Latest);
    let mediator = Arc::new(RemoteMediator::new(store.clone(), remote.clone()));

    let cancel = CancellationToken::new();
    let task = {
        let mediator = mediator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { mediator.load(LoadType::Refresh, state(10, 10), &cancel).await })
    };
    remote.wait_for_call(CallKind::Latest, 1).await;
    cancel.cancel();

    let result = task.await.unwrap().unwrap();
    assert!(matches!(result, MediatorResult::Success { .. }));
    assert_eq!(ids(&store.scan_ordered(None, 10, Direction::Descending).await), vec![100]);
    assert_eq!(mediator.refresh_count(), 0);
}

#[tokio::test]
async fn test_concurrent_refreshes_coalesce() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=5).map(post)));
    remote.hold(CallKind::Latest);
    let mediator = Arc::new(RemoteMediator::new(store.clone(), remote.clone()));

    let spawn_refresh = || {
        let mediator = mediator.clone();
        tokio::spawn(async move {
            mediator
                .load(LoadType::Refresh, state(10, 10), &CancellationToken::new())
                .await
        })
    };
    let first = spawn_refresh();
    remote.wait_for_call(CallKind::Latest, 1).await;
    let second = spawn_refresh();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    remote.release(CallKind::Latest);

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(remote.count(CallKind::Latest), 1);
    assert_eq!(mediator.refresh_count(), 1);
    assert_eq!(store.len().await, 5);
}

#[tokio::test]
async fn test_repository_stream_refreshes_on_open() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=4).map(post)));
    let repo = Repository::builder(store, remote)
        .paging(PagingConfig {
            page_size: 2,
            initial_load_size: 3,
            refresh_on_open: true,
        })
        .build();

    let cancel = CancellationToken::new();
    let pages = repo.stream(cancel.clone());
    tokio::pin!(pages);

    let mut last = Vec::new();
    while let Some(page) = pages.next().await {
        last = ids(&page.items);
        if last.len() == 3 {
            break;
        }
    }
    assert_eq!(last, vec![4, 3, 2]);

    cancel.cancel();
    assert!(pages.next().await.is_none());
}
