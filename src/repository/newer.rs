//! Background watch for items newer than anything cached.
//!
//! Each tick asks the remote for records newer than the store's newest id and
//! inserts the unseen ones hidden, so open windows do not jump. The hidden
//! count is published for a "N new posts" affordance; [`NewerWatch::show_new`]
//! releases them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::paging::PagedView;
use crate::remote::RemoteApi;
use crate::store::EntityStore;

pub struct NewerWatch<E: Entity> {
    store: Arc<EntityStore<E>>,
    remote: Arc<dyn RemoteApi<E>>,
    view: PagedView<E>,
    interval: Duration,
    metrics: Option<Arc<SyncMetrics>>,
    count: watch::Sender<usize>,
}

impl<E: Entity> NewerWatch<E> {
    pub fn new(view: PagedView<E>, remote: Arc<dyn RemoteApi<E>>, interval: Duration) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            store: view.store().clone(),
            remote,
            view,
            interval,
            metrics: None,
            count,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hidden-count updates.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// One poll. Returns how many unseen records were staged.
    pub async fn poll_once(&self) -> Result<usize, SyncError> {
        let Some(newest) = self.store.newest_id().await else {
            return Ok(0);
        };
        let fetched = self.remote.get_newer(newest).await?;

        let staged = self
            .store
            .transaction(|tx| {
                let mut staged = 0;
                for mut record in fetched {
                    if tx.contains(record.id()) {
                        continue;
                    }
                    record.set_visible(false);
                    tx.upsert(record)?;
                    staged += 1;
                }
                Ok(staged)
            })
            .await?;

        let hidden = self.store.hidden_count().await;
        self.count.send_replace(hidden);
        if let Some(metrics) = &self.metrics {
            let total = self.store.len().await;
            metrics.set_store_rows(E::KIND, total - hidden, hidden);
        }
        if staged > 0 {
            info!(kind = %E::KIND, staged, hidden, "Staged newer items");
        }
        Ok(staged)
    }

    /// Republish the count from the store. Hidden rows can vanish without a
    /// poll, e.g. when a REFRESH replaces the cached set.
    pub async fn resync(&self) -> usize {
        let hidden = self.store.hidden_count().await;
        self.count.send_if_modified(|count| std::mem::replace(count, hidden) != hidden);
        hidden
    }

    /// Release every hidden record into the view.
    pub async fn show_new(&self) -> Result<usize, SyncError> {
        let revealed = self.store.reveal_hidden().await?;
        self.count.send_replace(0);
        self.view.invalidate();
        debug!(kind = %E::KIND, revealed, "Revealed newer items");
        Ok(revealed)
    }

    /// Poll every interval until `cancel` fires. Failures are logged and
    /// retried on the next tick. Store writes between polls resync the count.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut versions = self.store.subscribe();
            info!(kind = %E::KIND, interval_ms = self.interval.as_millis() as u64, "Newer-items watch started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    changed = versions.changed() => {
                        if changed.is_ok() {
                            self.resync().await;
                        }
                        continue;
                    }
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = self.poll_once() => outcome,
                };
                let label = match &outcome {
                    Ok(_) => "success",
                    Err(e) => {
                        warn!(kind = %E::KIND, error = %e, "Newer-items poll failed");
                        e.label()
                    }
                };
                if let Some(metrics) = &self.metrics {
                    metrics.record_newer_poll(E::KIND, label);
                }
            }
            info!(kind = %E::KIND, "Newer-items watch stopped");
        })
    }
}
