//! Local deltas for optimistic mutations.
//!
//! A delta is computed and applied synchronously inside a store transaction
//! and remembers exactly what it changed, so [`LocalDelta::revert`] restores
//! the pre-mutation record and nothing else.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::entity::record::new_staged_id;
use crate::entity::{AttachmentType, Entity, EntityId, SetField, UserId};
use crate::store::{StoreError, Transaction};

/// The closed set of optimistic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Like,
    Unlike,
    Participate,
    Unparticipate,
    Delete,
    Save,
}

/// Operations that supersede each other for the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFamily {
    Like,
    Participation,
    Delete,
    Save,
}

impl OperationKind {
    pub fn family(&self) -> OpFamily {
        match self {
            OperationKind::Like | OperationKind::Unlike => OpFamily::Like,
            OperationKind::Participate | OperationKind::Unparticipate => OpFamily::Participation,
            OperationKind::Delete => OpFamily::Delete,
            OperationKind::Save => OpFamily::Save,
        }
    }

    /// Set field the operation toggles, if it is a membership operation.
    pub fn target_field(&self) -> Option<SetField> {
        match self {
            OperationKind::Like | OperationKind::Unlike => Some(SetField::LikeOwners),
            OperationKind::Participate | OperationKind::Unparticipate => {
                Some(SetField::Participants)
            }
            OperationKind::Delete | OperationKind::Save => None,
        }
    }

    /// Whether kind `E` carries what this operation needs.
    pub fn supported_by<E: Entity>(&self) -> bool {
        self.target_field()
            .map_or(true, |field| E::set_fields().contains(&field))
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Like => "like",
            OperationKind::Unlike => "unlike",
            OperationKind::Participate => "participate",
            OperationKind::Unparticipate => "unparticipate",
            OperationKind::Delete => "delete",
            OperationKind::Save => "save",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A local file waiting to be uploaded before a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttachment {
    pub path: PathBuf,
    pub kind: AttachmentType,
}

/// A mutation request.
#[derive(Debug, Clone)]
pub enum Mutation<E> {
    Like,
    Unlike,
    Participate,
    Unparticipate,
    Delete,
    Save {
        record: E,
        attachment: Option<PendingAttachment>,
    },
}

impl<E> Mutation<E> {
    pub fn kind(&self) -> OperationKind {
        match self {
            Mutation::Like => OperationKind::Like,
            Mutation::Unlike => OperationKind::Unlike,
            Mutation::Participate => OperationKind::Participate,
            Mutation::Unparticipate => OperationKind::Unparticipate,
            Mutation::Delete => OperationKind::Delete,
            Mutation::Save { .. } => OperationKind::Save,
        }
    }
}

/// What an applied mutation changed locally.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalDelta<E> {
    /// Nothing was written (no viewer, or the row is gone).
    Nothing,
    /// A set membership was added or removed.
    Member {
        id: EntityId,
        field: SetField,
        user: UserId,
        added: bool,
    },
    /// A row was removed; the full pre-delete record is kept for reinsertion.
    Deleted { snapshot: E },
    /// A speculative row was written for a save.
    Staged {
        id: EntityId,
        previous: Option<E>,
    },
}

impl<E: Entity> LocalDelta<E> {
    /// Apply the local half of `mutation` to record `id`.
    pub fn apply(
        tx: &mut Transaction<'_, E>,
        id: EntityId,
        mutation: &Mutation<E>,
    ) -> Result<Self, StoreError> {
        let kind = mutation.kind();
        if let Some(field) = kind.target_field() {
            let Some(user) = tx.viewer() else {
                return Ok(LocalDelta::Nothing);
            };
            let added = matches!(kind, OperationKind::Like | OperationKind::Participate);
            let changed = if added {
                tx.add_to_set(id, field, user)
            } else {
                tx.remove_from_set(id, field, user)
            };
            return Ok(if changed {
                LocalDelta::Member {
                    id,
                    field,
                    user,
                    added,
                }
            } else {
                LocalDelta::Nothing
            });
        }

        match mutation {
            Mutation::Delete => Ok(match tx.delete_by_id(id) {
                Some(snapshot) => LocalDelta::Deleted { snapshot },
                None => LocalDelta::Nothing,
            }),
            Mutation::Save { record, .. } => {
                let mut speculative = record.clone();
                let staged_id = match (record.id(), id) {
                    (0, staged) if staged < 0 => staged,
                    (0, _) => new_staged_id(),
                    (existing, _) => existing,
                };
                speculative.set_id(staged_id);
                speculative.set_visible(true);

                let previous = tx.get(staged_id).cloned();
                tx.upsert(speculative)?;
                Ok(LocalDelta::Staged {
                    id: staged_id,
                    previous,
                })
            }
            _ => Ok(LocalDelta::Nothing),
        }
    }

    /// Apply the exact inverse of this delta.
    pub fn revert(&self, tx: &mut Transaction<'_, E>) -> Result<(), StoreError> {
        match self {
            LocalDelta::Nothing => {}
            LocalDelta::Member {
                id,
                field,
                user,
                added,
            } => {
                if *added {
                    tx.remove_from_set(*id, *field, *user);
                } else {
                    tx.add_to_set(*id, *field, *user);
                }
            }
            LocalDelta::Deleted { snapshot } => {
                tx.upsert(snapshot.clone())?;
            }
            LocalDelta::Staged { id, previous } => match previous {
                Some(previous) => tx.upsert(previous.clone())?,
                None => {
                    tx.delete_by_id(*id);
                }
            },
        }
        Ok(())
    }

    /// Id of the locally staged row a save wrote, if any.
    pub fn staged_id(&self) -> Option<EntityId> {
        match self {
            LocalDelta::Staged { id, .. } => Some(*id),
            _ => None,
        }
    }
}
