//! Scriptable in-memory remote.
//!
//! [`ScriptedRemote`] behaves like a small server: it owns a record set, hands
//! out ids on save and applies like/participation on behalf of a fixed user.
//! Tests script it with:
//! - `fail_next(kind, err)`: the next call of `kind` fails with `err`
//! - `set_offline(true)`: every call fails with a network error
//! - `hold(kind)` / `release(kind)`: calls of `kind` block at a gate
//! - a call log with started / completed / failed / cancelled entries

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use crate::entity::{Attachment, Cursor, Entity, EntityId, SetField, UserId};
use crate::error::SyncError;
use crate::mutation::{OperationKind, PendingAttachment};
use crate::remote::{MediaUploader, RemoteApi};

/// Remote endpoints, as seen by the call log and the scripting hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Latest,
    Before,
    After,
    Newer,
    GetById,
    Save,
    Delete,
    Like,
    Unlike,
    Participate,
    Unparticipate,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Started,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub kind: CallKind,
    pub id: Option<EntityId>,
    pub outcome: CallOutcome,
}

struct State<E> {
    records: BTreeMap<EntityId, E>,
    failures: HashMap<CallKind, VecDeque<SyncError>>,
    offline: bool,
    log: Vec<CallRecord>,
}

impl<E: Entity> State<E> {
    fn anchor(&self, id: EntityId) -> Cursor {
        self.records
            .get(&id)
            .map_or(Cursor::new(id, id), Cursor::of)
    }

    /// Records in descending order.
    fn descending(&self) -> Vec<&E> {
        let mut rows: Vec<&E> = self.records.values().collect();
        rows.sort_by_key(|record| std::cmp::Reverse(Cursor::of(*record)));
        rows
    }

    fn next_id(&self) -> EntityId {
        self.records.keys().next_back().map_or(1, |max| max + 1)
    }
}

/// In-memory [`RemoteApi`] with programmable failures and gates.
pub struct ScriptedRemote<E> {
    state: Mutex<State<E>>,
    gates: Mutex<HashMap<CallKind, watch::Sender<bool>>>,
    calls: Notify,
    user: Option<UserId>,
}

impl<E: Entity> ScriptedRemote<E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                records: BTreeMap::new(),
                failures: HashMap::new(),
                offline: false,
                log: Vec::new(),
            }),
            gates: Mutex::new(HashMap::new()),
            calls: Notify::new(),
            user: None,
        }
    }

    /// Act on behalf of `user` for like and participation calls.
    pub fn with_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_records(self, records: impl IntoIterator<Item = E>) -> Self {
        self.seed(records);
        self
    }

    fn state(&self) -> MutexGuard<'_, State<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace server-side records.
    pub fn seed(&self, records: impl IntoIterator<Item = E>) {
        let mut state = self.state();
        for record in records {
            state.records.insert(record.id(), record);
        }
    }

    /// Remove a record server-side without going through the API.
    pub fn remove(&self, id: EntityId) -> Option<E> {
        self.state().records.remove(&id)
    }

    pub fn record(&self, id: EntityId) -> Option<E> {
        self.state().records.get(&id).cloned()
    }

    pub fn fail_next(&self, kind: CallKind, err: SyncError) {
        self.state().failures.entry(kind).or_default().push_back(err);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    fn gate(&self, kind: CallKind) -> watch::Receiver<bool> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(kind)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Block calls of `kind` until [`ScriptedRemote::release`].
    pub fn hold(&self, kind: CallKind) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(kind)
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    pub fn release(&self, kind: CallKind) {
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gate) = gates.get(&kind) {
            gate.send_replace(false);
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().log.clone()
    }

    /// Number of calls of `kind` that reached the remote.
    pub fn count(&self, kind: CallKind) -> usize {
        self.state()
            .log
            .iter()
            .filter(|call| call.kind == kind && call.outcome == CallOutcome::Started)
            .count()
    }

    pub fn outcomes(&self, kind: CallKind) -> Vec<CallOutcome> {
        self.state()
            .log
            .iter()
            .filter(|call| call.kind == kind && call.outcome != CallOutcome::Started)
            .map(|call| call.outcome)
            .collect()
    }

    /// Wait until at least `n` calls of `kind` have started.
    pub async fn wait_for_call(&self, kind: CallKind, n: usize) {
        loop {
            let notified = self.calls.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count(kind) >= n {
                return;
            }
            notified.await;
        }
    }

    fn log(&self, kind: CallKind, id: Option<EntityId>, outcome: CallOutcome) {
        self.state().log.push(CallRecord { kind, id, outcome });
        self.calls.notify_waiters();
    }

    async fn call<T>(
        &self,
        kind: CallKind,
        id: Option<EntityId>,
        op: impl FnOnce(&mut State<E>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut guard = CallGuard {
            remote: self,
            kind,
            id,
            finished: false,
        };
        self.log(kind, id, CallOutcome::Started);

        let mut gate = self.gate(kind);
        if gate.wait_for(|held| !held).await.is_err() {
            return Err(SyncError::Cancelled);
        }

        let result = {
            let mut state = self.state();
            if let Some(err) = state.failures.get_mut(&kind).and_then(VecDeque::pop_front) {
                Err(err)
            } else if state.offline {
                Err(SyncError::Network("remote unreachable".to_string()))
            } else {
                op(&mut state)
            }
        };

        guard.finished = true;
        let outcome = if result.is_ok() {
            CallOutcome::Completed
        } else {
            CallOutcome::Failed
        };
        self.log(kind, id, outcome);
        result
    }

    fn toggle(
        &self,
        state: &mut State<E>,
        id: EntityId,
        field: SetField,
        add: bool,
    ) -> Result<E, SyncError> {
        let Some(user) = self.user else {
            return Err(SyncError::RemoteRejected {
                status: 401,
                message: "unauthorized".to_string(),
            });
        };
        let record = state
            .records
            .get_mut(&id)
            .ok_or(SyncError::NotFound { kind: E::KIND, id })?;
        if let Some(set) = record.members_mut(field) {
            if add {
                set.insert(user);
            } else {
                set.remove(&user);
            }
        }
        let mut answer = record.clone();
        answer.refresh_derived(Some(user));
        Ok(answer)
    }

    fn unsupported(operation: OperationKind) -> Option<SyncError> {
        (!operation.supported_by::<E>()).then_some(SyncError::Unsupported {
            kind: E::KIND,
            operation,
        })
    }
}

impl<E: Entity> Default for ScriptedRemote<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs a cancelled call when the caller's future is dropped mid-flight.
struct CallGuard<'a, E: Entity> {
    remote: &'a ScriptedRemote<E>,
    kind: CallKind,
    id: Option<EntityId>,
    finished: bool,
}

impl<E: Entity> Drop for CallGuard<'_, E> {
    fn drop(&mut self) {
        if !self.finished {
            self.remote.log(self.kind, self.id, CallOutcome::Cancelled);
        }
    }
}

#[async_trait]
impl<E: Entity> RemoteApi<E> for ScriptedRemote<E> {
    async fn get_latest(&self, count: usize) -> Result<Vec<E>, SyncError> {
        self.call(CallKind::Latest, None, |state| {
            Ok(state.descending().into_iter().take(count).cloned().collect())
        })
        .await
    }

    async fn get_before(&self, id: EntityId, count: usize) -> Result<Vec<E>, SyncError> {
        self.call(CallKind::Before, Some(id), |state| {
            let anchor = state.anchor(id);
            Ok(state
                .descending()
                .into_iter()
                .filter(|record| Cursor::of(*record) < anchor)
                .take(count)
                .cloned()
                .collect())
        })
        .await
    }

    async fn get_after(&self, id: EntityId, count: usize) -> Result<Vec<E>, SyncError> {
        self.call(CallKind::After, Some(id), |state| {
            let anchor = state.anchor(id);
            let mut newer: Vec<E> = state
                .descending()
                .into_iter()
                .rev()
                .filter(|record| Cursor::of(*record) > anchor)
                .take(count)
                .cloned()
                .collect();
            newer.reverse();
            Ok(newer)
        })
        .await
    }

    async fn get_newer(&self, id: EntityId) -> Result<Vec<E>, SyncError> {
        self.call(CallKind::Newer, Some(id), |state| {
            let anchor = state.anchor(id);
            Ok(state
                .descending()
                .into_iter()
                .filter(|record| Cursor::of(*record) > anchor)
                .cloned()
                .collect())
        })
        .await
    }

    async fn get_by_id(&self, id: EntityId) -> Result<E, SyncError> {
        self.call(CallKind::GetById, Some(id), |state| {
            state
                .records
                .get(&id)
                .cloned()
                .ok_or(SyncError::NotFound { kind: E::KIND, id })
        })
        .await
    }

    async fn save(&self, mut record: E) -> Result<E, SyncError> {
        let id = record.id();
        self.call(CallKind::Save, Some(id), |state| {
            if record.id() <= 0 {
                record.set_id(state.next_id());
            } else if !state.records.contains_key(&record.id()) {
                return Err(SyncError::NotFound {
                    kind: E::KIND,
                    id: record.id(),
                });
            }
            record.set_visible(true);
            record.refresh_derived(self.user);
            state.records.insert(record.id(), record.clone());
            Ok(record)
        })
        .await
    }

    async fn delete_by_id(&self, id: EntityId) -> Result<(), SyncError> {
        self.call(CallKind::Delete, Some(id), |state| {
            state
                .records
                .remove(&id)
                .map(|_| ())
                .ok_or(SyncError::NotFound { kind: E::KIND, id })
        })
        .await
    }

    async fn like(&self, id: EntityId) -> Result<E, SyncError> {
        if let Some(err) = Self::unsupported(OperationKind::Like) {
            return Err(err);
        }
        self.call(CallKind::Like, Some(id), |state| {
            self.toggle(state, id, SetField::LikeOwners, true)
        })
        .await
    }

    async fn unlike(&self, id: EntityId) -> Result<E, SyncError> {
        if let Some(err) = Self::unsupported(OperationKind::Unlike) {
            return Err(err);
        }
        self.call(CallKind::Unlike, Some(id), |state| {
            self.toggle(state, id, SetField::LikeOwners, false)
        })
        .await
    }

    async fn participate(&self, id: EntityId) -> Result<E, SyncError> {
        if let Some(err) = Self::unsupported(OperationKind::Participate) {
            return Err(err);
        }
        self.call(CallKind::Participate, Some(id), |state| {
            self.toggle(state, id, SetField::Participants, true)
        })
        .await
    }

    async fn unparticipate(&self, id: EntityId) -> Result<E, SyncError> {
        if let Some(err) = Self::unsupported(OperationKind::Unparticipate) {
            return Err(err);
        }
        self.call(CallKind::Unparticipate, Some(id), |state| {
            self.toggle(state, id, SetField::Participants, false)
        })
        .await
    }
}

/// Uploader that never touches the filesystem or network.
#[derive(Default)]
pub struct ScriptedUploader {
    failures: Mutex<VecDeque<SyncError>>,
    uploads: Mutex<Vec<PendingAttachment>>,
}

impl ScriptedUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: SyncError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(err);
    }

    pub fn uploads(&self) -> Vec<PendingAttachment> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MediaUploader for ScriptedUploader {
    async fn upload(&self, attachment: &PendingAttachment) -> Result<Attachment, SyncError> {
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(err);
        }
        let mut uploads = self.uploads.lock().unwrap_or_else(PoisonError::into_inner);
        uploads.push(attachment.clone());
        let name = attachment
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Attachment {
            url: format!("https://media.test/{}/{name}", uploads.len()),
            kind: attachment.kind,
        })
    }
}
