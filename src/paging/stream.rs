//! Stream adapter over a [`Window`].

use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;

use crate::entity::Entity;
use crate::paging::view::{Page, Window};

impl<E: Entity> Window<E> {
    /// Lazy, infinite sequence of snapshots.
    ///
    /// The current contents are yielded first, then one snapshot per change.
    /// The stream ends when `cancel` fires or it is dropped; cancelling also
    /// cancels any load the window started.
    pub fn into_stream(self, cancel: CancellationToken) -> impl Stream<Item = Page<E>> + Send {
        let window = self.with_cancel(cancel.child_token());
        stream::unfold((window, cancel, true), |(mut window, cancel, first)| async move {
            if first {
                if cancel.is_cancelled() {
                    return None;
                }
            } else {
                let alive = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    alive = window.changed() => alive,
                };
                if !alive {
                    window.cancel_token().cancel();
                    return None;
                }
            }
            let page = window.snapshot().await;
            Some((page, (window, cancel, false)))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;

    use super::*;
    use crate::entity::{Direction, Post};
    use crate::paging::view::PagedView;
    use crate::store::EntityStore;

    fn post(id: i64) -> Post {
        let mut post = Post::draft(1, "x");
        post.id = id;
        post
    }

    #[tokio::test]
    async fn test_stream_yields_current_then_changes() {
        let store = Arc::new(EntityStore::in_memory());
        store.upsert(post(1)).await.unwrap();
        let view = PagedView::local(store.clone(), Direction::Descending);
        let cancel = CancellationToken::new();
        let mut pages = Box::pin(view.open_window(5, 5).into_stream(cancel.clone()));

        assert_eq!(pages.next().await.unwrap().items.len(), 1);
        store.upsert(post(2)).await.unwrap();
        assert_eq!(pages.next().await.unwrap().items.len(), 2);

        cancel.cancel();
        assert!(pages.next().await.is_none());
    }
}
