//! Integration tests for the newer-items watch.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use feed_sync::entity::{EntityId, Post};
use feed_sync::error::SyncError;
use feed_sync::metrics::SyncMetrics;
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

async fn repo_with_feed(
    cached: EntityId,
) -> (Repository<Post>, Arc<EntityStore<Post>>, Arc<ScriptedRemote<Post>>) {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    store.upsert_many((1..=cached).map(post).collect()).await.unwrap();
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=cached).map(post)));
    let repo = Repository::builder(store.clone(), remote.clone())
        .newer_every(Duration::from_secs(30))
        .build();
    (repo, store, remote)
}

#[tokio::test]
async fn test_new_posts_stay_hidden_until_shown() {
    let (repo, store, remote) = repo_with_feed(5).await;
    let mut window = repo.open_window();
    let before = window.snapshot().await;
    assert_eq!(ids(&before.items), vec![5, 4, 3, 2, 1]);

    remote.seed((6..=8).map(post));
    let staged = repo.newer().unwrap().poll_once().await.unwrap();
    assert_eq!(staged, 3);
    assert_eq!(repo.newer_count(), 3);
    assert_eq!(store.len().await, 8);

    let during = window.snapshot().await;
    assert_eq!(ids(&during.items), ids(&before.items));
    assert_eq!(during.generation, before.generation);

    assert_eq!(repo.show_new().await.unwrap(), 3);
    assert_eq!(repo.newer_count(), 0);
    assert!(window.changed().await);
    let after = window.snapshot().await;
    assert_eq!(ids(&after.items), vec![8, 7, 6, 5, 4, 3, 2, 1]);
    assert!(after.generation > before.generation);
}

#[tokio::test]
async fn test_repeated_polls_do_not_double_count() {
    let (repo, _store, remote) = repo_with_feed(2).await;
    remote.seed([post(3)]);
    let newer = repo.newer().unwrap();

    assert_eq!(newer.poll_once().await.unwrap(), 1);
    assert_eq!(newer.poll_once().await.unwrap(), 0);
    assert_eq!(repo.newer_count(), 1);
}

#[tokio::test]
async fn test_empty_store_skips_the_remote() {
    let (repo, _store, remote) = repo_with_feed(0).await;
    remote.seed((1..=3).map(post));

    assert_eq!(repo.newer().unwrap().poll_once().await.unwrap(), 0);
    assert_eq!(remote.count(CallKind::Newer), 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_watch_publishes_count() {
    let store = Arc::new(EntityStore::<Post>::in_memory());
    store.upsert_many((1..=2).map(post).collect()).await.unwrap();
    let remote = Arc::new(ScriptedRemote::new().with_records((1..=2).map(post)));
    let metrics = Arc::new(SyncMetrics::new().unwrap());
    let repo = Repository::builder(store, remote.clone())
        .metrics(metrics.clone())
        .newer_every(Duration::from_secs(10))
        .build();
    let mut count = repo.newer().unwrap().subscribe();

    let cancel = CancellationToken::new();
    let handle = repo.spawn_newer(cancel.clone()).unwrap();

    remote.fail_next(CallKind::Newer, SyncError::Network("offline".into()));
    remote.seed((3..=5).map(post));
    count.changed().await.unwrap();
    assert_eq!(*count.borrow_and_update(), 3);
    assert_eq!(remote.count(CallKind::Newer), 2);

    let text = metrics.gather_text().unwrap();
    assert!(text.contains("newer_polls"));

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_refresh_clears_stale_newer_count() {
    let (repo, store, remote) = repo_with_feed(5).await;
    remote.seed((6..=8).map(post));
    repo.newer().unwrap().poll_once().await.unwrap();
    assert_eq!(repo.newer_count(), 3);
    assert_eq!(store.hidden_count().await, 3);

    repo.refresh().await.unwrap();
    assert_eq!(store.hidden_count().await, 0);
    assert_eq!(repo.newer_count(), 0);
    assert_eq!(repo.show_new().await.unwrap(), 0);
    let page = repo.open_window().snapshot().await;
    assert_eq!(page.items.first().map(|p| p.id), Some(8));
}
