//! Entity store: the durable, ordered, transactional table for one kind.
//!
//! The store is the single owner of cached records. It:
//! - Keeps rows keyed by id plus a `(ordering key, id)` index for scans
//! - Maintains the association index for set fields
//! - Recomputes derived "by me" flags on every write and viewer change
//! - Runs every write inside a transaction with an undo log, so a failed
//!   closure or a failed durable commit leaves no trace
//! - Publishes a version number after each commit so page windows can react

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::entity::{Cursor, Direction, Entity, EntityId, EntityKind, SetField, UserId};
use crate::store::relations::RelationIndex;
use crate::store::snapshot::{SnapshotError, SnapshotFile};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("cannot store an unsaved {0} (id 0)")]
    Unsaved(EntityKind),

    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// Rows and indexes, guarded together by the store lock.
#[derive(Debug)]
pub struct Tables<E: Entity> {
    rows: HashMap<EntityId, E>,
    order: BTreeSet<Cursor>,
    relations: RelationIndex,
    viewer: Option<UserId>,
}

impl<E: Entity> Tables<E> {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
            order: BTreeSet::new(),
            relations: RelationIndex::new(),
            viewer: None,
        }
    }

    /// Insert or replace a row, keeping both indexes in step.
    fn put(&mut self, record: E) {
        self.take(record.id());
        self.order.insert(Cursor::of(&record));
        self.relations.index(&record);
        self.rows.insert(record.id(), record);
    }

    /// Remove a row and everything indexed under it.
    fn take(&mut self, id: EntityId) -> Option<E> {
        let old = self.rows.remove(&id)?;
        self.order.remove(&Cursor::of(&old));
        self.relations.unindex(&old);
        Some(old)
    }

    /// Replay an undo log, newest entry first, then put the viewer back.
    fn restore(&mut self, undo: Undo<E>) {
        for (id, previous) in undo.rows.into_iter().rev() {
            match previous {
                Some(record) => self.put(record),
                None => {
                    self.take(id);
                }
            }
        }
        if let Some(viewer) = undo.viewer {
            self.viewer = viewer;
        }
    }

    fn scan(&self, from: Bound<Cursor>, limit: usize, direction: Direction) -> Vec<E> {
        let cursors: Box<dyn Iterator<Item = &Cursor>> = match direction {
            Direction::Descending => Box::new(self.order.range((Bound::Unbounded, from)).rev()),
            Direction::Ascending => Box::new(self.order.range((from, Bound::Unbounded))),
        };
        cursors
            .filter_map(|cursor| self.rows.get(&cursor.id))
            .filter(|record| record.is_visible())
            .take(limit)
            .cloned()
            .collect()
    }

    fn visible_edge(&self, direction: Direction) -> Option<Cursor> {
        let mut cursors: Box<dyn Iterator<Item = &Cursor>> = match direction {
            Direction::Descending => Box::new(self.order.iter().rev()),
            Direction::Ascending => Box::new(self.order.iter()),
        };
        cursors
            .find(|cursor| self.rows.get(&cursor.id).is_some_and(Entity::is_visible))
            .copied()
    }
}

/// Pre-transaction state of everything a transaction touched.
struct Undo<E> {
    rows: Vec<(EntityId, Option<E>)>,
    viewer: Option<Option<UserId>>,
}

/// Writes of one transaction, applied in place and reversible until commit.
pub struct Transaction<'a, E: Entity> {
    tables: &'a mut Tables<E>,
    undo: Undo<E>,
    touched: HashSet<EntityId>,
}

impl<'a, E: Entity> Transaction<'a, E> {
    fn new(tables: &'a mut Tables<E>) -> Self {
        Self {
            tables,
            undo: Undo {
                rows: Vec::new(),
                viewer: None,
            },
            touched: HashSet::new(),
        }
    }

    /// Remember the pre-transaction state of `id` the first time it is touched.
    fn record_undo(&mut self, id: EntityId) {
        if self.touched.insert(id) {
            self.undo.rows.push((id, self.tables.rows.get(&id).cloned()));
        }
    }

    pub fn viewer(&self) -> Option<UserId> {
        self.tables.viewer
    }

    /// Switch the viewer and recompute every row's derived flags.
    /// Returns whether the viewer changed.
    pub fn set_viewer(&mut self, viewer: Option<UserId>) -> bool {
        if self.tables.viewer == viewer {
            return false;
        }
        let old = std::mem::replace(&mut self.tables.viewer, viewer);
        self.undo.viewer.get_or_insert(old);
        let ids: Vec<EntityId> = self.tables.rows.keys().copied().collect();
        for id in ids {
            self.update(id, |_| {});
        }
        true
    }

    pub fn get(&self, id: EntityId) -> Option<&E> {
        self.tables.rows.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.tables.rows.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tables.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.rows.is_empty()
    }

    /// Insert or overwrite a record. Derived flags are recomputed for the
    /// current viewer before the row becomes visible.
    pub fn upsert(&mut self, mut record: E) -> Result<(), StoreError> {
        if record.id() == 0 {
            return Err(StoreError::Unsaved(E::KIND));
        }
        record.refresh_derived(self.tables.viewer);
        self.record_undo(record.id());
        self.tables.put(record);
        Ok(())
    }

    /// Upsert a batch. Fails before writing anything if a record is unsaved.
    pub fn upsert_many(&mut self, records: impl IntoIterator<Item = E>) -> Result<usize, StoreError> {
        let records: Vec<E> = records.into_iter().collect();
        if records.iter().any(|r| r.id() == 0) {
            return Err(StoreError::Unsaved(E::KIND));
        }
        let count = records.len();
        for record in records {
            self.upsert(record)?;
        }
        Ok(count)
    }

    pub fn delete_by_id(&mut self, id: EntityId) -> Option<E> {
        if !self.contains(id) {
            return None;
        }
        self.record_undo(id);
        self.tables.take(id)
    }

    pub fn delete_where(&mut self, predicate: impl Fn(&E) -> bool) -> Vec<E> {
        let ids: Vec<EntityId> = self
            .tables
            .rows
            .values()
            .filter(|record| predicate(record))
            .map(Entity::id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.delete_by_id(id))
            .collect()
    }

    /// Remove every row.
    pub fn clear(&mut self) -> usize {
        self.delete_where(|_| true).len()
    }

    /// Patch a row in place. Returns false when the row is gone.
    pub fn update(&mut self, id: EntityId, patch: impl FnOnce(&mut E)) -> bool {
        let Some(mut record) = self.tables.rows.get(&id).cloned() else {
            return false;
        };
        patch(&mut record);
        record.set_id(id);
        record.refresh_derived(self.tables.viewer);
        self.record_undo(id);
        self.tables.put(record);
        true
    }

    /// Add `user` to a set field. Missing rows and unknown fields are no-ops.
    /// Returns whether the set changed.
    pub fn add_to_set(&mut self, id: EntityId, field: SetField, user: UserId) -> bool {
        self.edit_set(id, field, |set| set.insert(user))
    }

    /// Remove `user` from a set field. Returns whether the set changed.
    pub fn remove_from_set(&mut self, id: EntityId, field: SetField, user: UserId) -> bool {
        self.edit_set(id, field, |set| set.remove(&user))
    }

    fn edit_set(
        &mut self,
        id: EntityId,
        field: SetField,
        edit: impl FnOnce(&mut BTreeSet<UserId>) -> bool,
    ) -> bool {
        let Some(mut record) = self.tables.rows.get(&id).cloned() else {
            return false;
        };
        let Some(set) = record.members_mut(field) else {
            return false;
        };
        if !edit(set) {
            return false;
        }
        record.refresh_derived(self.tables.viewer);
        self.record_undo(id);
        self.tables.put(record);
        true
    }

    /// Release every hidden row into the visible set.
    pub fn reveal_hidden(&mut self) -> usize {
        let hidden: Vec<EntityId> = self
            .tables
            .rows
            .values()
            .filter(|record| !record.is_visible())
            .map(Entity::id)
            .collect();
        for &id in &hidden {
            self.update(id, |record| record.set_visible(true));
        }
        hidden.len()
    }

    fn is_dirty(&self) -> bool {
        !self.undo.rows.is_empty()
    }

    fn into_undo(self) -> Undo<E> {
        self.undo
    }
}

/// The entity store for one kind.
pub struct EntityStore<E: Entity> {
    tables: RwLock<Tables<E>>,
    version: watch::Sender<u64>,
    snapshot: Option<SnapshotFile>,
}

impl<E: Entity> EntityStore<E> {
    /// A store with no durable backing.
    pub fn in_memory() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::new()),
            version,
            snapshot: None,
        }
    }

    /// Open the store for `E`, loading its snapshot if one is configured.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let Some(snapshot) = SnapshotFile::for_config(config, E::KIND) else {
            return Ok(Self::in_memory());
        };

        let rows: Vec<E> = snapshot.load().await?;
        let mut tables = Tables::new();
        for mut record in rows {
            record.refresh_derived(None);
            tables.put(record);
        }

        info!(
            kind = %E::KIND,
            rows = tables.rows.len(),
            path = %snapshot.path().display(),
            "Opened entity store"
        );

        let (version, _) = watch::channel(0);
        Ok(Self {
            tables: RwLock::new(tables),
            version,
            snapshot: Some(snapshot),
        })
    }

    /// Receiver that changes after every committed write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Run `f` as one atomic transaction.
    ///
    /// `f` runs synchronously under the write lock. If it returns an error, or
    /// the durable commit fails, every row it touched is restored. Readers
    /// never observe a partially applied transaction.
    pub async fn transaction<R>(
        &self,
        f: impl FnOnce(&mut Transaction<'_, E>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut tables = self.tables.write().await;

        let mut tx = Transaction::new(&mut *tables);
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                let undo = tx.into_undo();
                tables.restore(undo);
                return Err(e);
            }
        };
        if !tx.is_dirty() {
            return Ok(value);
        }
        let undo = tx.into_undo();
        let touched = undo.rows.len();

        if let Some(snapshot) = &self.snapshot {
            let written = match snapshot.encode(tables.rows.values()) {
                Ok(bytes) => snapshot.write_bytes(&bytes).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tables.restore(undo);
                return Err(e.into());
            }
        }
        drop(tables);

        self.version.send_modify(|v| *v += 1);
        debug!(kind = %E::KIND, touched, version = self.version(), "Committed transaction");
        Ok(value)
    }

    pub async fn get(&self, id: EntityId) -> Option<E> {
        self.tables.read().await.rows.get(&id).cloned()
    }

    pub async fn contains(&self, id: EntityId) -> bool {
        self.tables.read().await.rows.contains_key(&id)
    }

    /// Number of rows, hidden ones included.
    pub async fn len(&self) -> usize {
        self.tables.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.rows.is_empty()
    }

    pub async fn hidden_count(&self) -> usize {
        self.tables
            .read()
            .await
            .rows
            .values()
            .filter(|record| !record.is_visible())
            .count()
    }

    /// Largest server id held, hidden rows included. Staged rows are ignored.
    pub async fn newest_id(&self) -> Option<EntityId> {
        self.tables
            .read()
            .await
            .rows
            .keys()
            .copied()
            .filter(|&id| id > 0)
            .max()
    }

    pub async fn upsert(&self, record: E) -> Result<(), StoreError> {
        self.transaction(|tx| tx.upsert(record)).await
    }

    pub async fn upsert_many(&self, records: Vec<E>) -> Result<usize, StoreError> {
        self.transaction(|tx| tx.upsert_many(records)).await
    }

    pub async fn delete_by_id(&self, id: EntityId) -> Result<Option<E>, StoreError> {
        self.transaction(|tx| Ok(tx.delete_by_id(id))).await
    }

    pub async fn delete_where(
        &self,
        predicate: impl Fn(&E) -> bool,
    ) -> Result<Vec<E>, StoreError> {
        self.transaction(|tx| Ok(tx.delete_where(predicate))).await
    }

    pub async fn add_to_set(
        &self,
        id: EntityId,
        field: SetField,
        user: UserId,
    ) -> Result<bool, StoreError> {
        self.transaction(|tx| Ok(tx.add_to_set(id, field, user))).await
    }

    pub async fn remove_from_set(
        &self,
        id: EntityId,
        field: SetField,
        user: UserId,
    ) -> Result<bool, StoreError> {
        self.transaction(|tx| Ok(tx.remove_from_set(id, field, user))).await
    }

    pub async fn reveal_hidden(&self) -> Result<usize, StoreError> {
        self.transaction(|tx| Ok(tx.reveal_hidden())).await
    }

    pub async fn viewer(&self) -> Option<UserId> {
        self.tables.read().await.viewer
    }

    /// Switch the viewer and recompute every row's derived flags in the same
    /// transaction.
    pub async fn set_viewer(&self, viewer: Option<UserId>) -> Result<(), StoreError> {
        self.transaction(|tx| {
            tx.set_viewer(viewer);
            Ok(())
        })
        .await
    }

    /// Visible rows strictly after `after` in `direction`, at most `limit`.
    pub async fn scan_ordered(
        &self,
        after: Option<Cursor>,
        limit: usize,
        direction: Direction,
    ) -> Vec<E> {
        let from = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.scan(from, limit, direction).await
    }

    /// Visible rows from an arbitrary bound in `direction`, at most `limit`.
    pub async fn scan(&self, from: Bound<Cursor>, limit: usize, direction: Direction) -> Vec<E> {
        self.tables.read().await.scan(from, limit, direction)
    }

    /// Visible rows ahead of `anchor` when scanning in `direction`.
    pub async fn count_before(&self, anchor: Cursor, direction: Direction) -> usize {
        let tables = self.tables.read().await;
        let ahead: Box<dyn Iterator<Item = &Cursor>> = match direction {
            Direction::Descending => {
                Box::new(tables.order.range((Bound::Excluded(anchor), Bound::Unbounded)))
            }
            Direction::Ascending => {
                Box::new(tables.order.range((Bound::Unbounded, Bound::Excluded(anchor))))
            }
        };
        ahead
            .filter(|cursor| tables.rows.get(&cursor.id).is_some_and(Entity::is_visible))
            .count()
    }

    /// First visible row when scanning in `direction`.
    pub async fn first_cursor(&self, direction: Direction) -> Option<Cursor> {
        self.tables.read().await.visible_edge(direction)
    }

    /// Last visible row when scanning in `direction`.
    pub async fn last_cursor(&self, direction: Direction) -> Option<Cursor> {
        let reversed = match direction {
            Direction::Descending => Direction::Ascending,
            Direction::Ascending => Direction::Descending,
        };
        self.tables.read().await.visible_edge(reversed)
    }

    pub async fn members_of(&self, field: SetField, parent: EntityId) -> Vec<UserId> {
        self.tables.read().await.relations.members_of(field, parent)
    }

    pub async fn parents_with_member(&self, field: SetField, user: UserId) -> Vec<EntityId> {
        self.tables
            .read()
            .await
            .relations
            .parents_with_member(field, user)
    }
}
