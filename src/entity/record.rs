//! Shared record vocabulary: ids, ordering cursors, set fields and the
//! [`Entity`] trait every cached kind implements.
//!
//! The store, mediator and mutation coordinator are generic over [`Entity`];
//! nothing above this module knows which concrete kind it is handling.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Unique identifier of a record within its store.
///
/// `0` marks an unsaved record. Negative ids mark records staged locally by an
/// optimistic save that the server has not confirmed yet.
pub type EntityId = i64;

/// Identifier of a user (author, liker, participant, viewer).
pub type UserId = i64;

/// Value of a feed's ordering field (an id or a publish timestamp).
pub type OrderKey = i64;

/// Next staged id handed out to optimistic saves.
static NEXT_STAGED_ID: AtomicI64 = AtomicI64::new(-1);

/// Allocate a fresh negative id for a locally staged record.
pub fn new_staged_id() -> EntityId {
    NEXT_STAGED_ID.fetch_sub(1, Ordering::Relaxed)
}

/// Whether `id` belongs to a staged (not yet server-confirmed) record.
pub fn is_staged(id: EntityId) -> bool {
    id < 0
}

/// Ordering key for kinds ordered by id.
///
/// Staged ids sort ahead of every server id so a freshly saved record shows up
/// at the head of a descending feed.
pub fn id_order_key(id: EntityId) -> OrderKey {
    if is_staged(id) {
        OrderKey::MAX.saturating_add(id)
    } else {
        id
    }
}

/// Which entity kind a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Event,
    Job,
    Comment,
    UserPreview,
}

impl EntityKind {
    /// Lowercase plural resource name, used for remote paths and snapshot files.
    pub fn resource(&self) -> &'static str {
        match self {
            EntityKind::Post => "posts",
            EntityKind::Event => "events",
            EntityKind::Job => "jobs",
            EntityKind::Comment => "comments",
            EntityKind::UserPreview => "users",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Post => write!(f, "post"),
            EntityKind::Event => write!(f, "event"),
            EntityKind::Job => write!(f, "job"),
            EntityKind::Comment => write!(f, "comment"),
            EntityKind::UserPreview => write!(f, "user_preview"),
        }
    }
}

/// A mutable many-to-many relation carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetField {
    /// Users who liked the record.
    LikeOwners,
    /// Users mentioned by a post.
    Mentions,
    /// Users participating in an event.
    Participants,
}

impl std::fmt::Display for SetField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetField::LikeOwners => write!(f, "like_owners"),
            SetField::Mentions => write!(f, "mentions"),
            SetField::Participants => write!(f, "participants"),
        }
    }
}

/// Scan direction over the ordered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Highest ordering key first (newest first for feeds).
    Descending,
    /// Lowest ordering key first.
    Ascending,
}

/// Position of a record in a store's total order.
///
/// Ties on the ordering key are broken by id, so a cursor always names exactly
/// one slot even when two records share a publish timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub key: OrderKey,
    pub id: EntityId,
}

impl Cursor {
    pub fn new(key: OrderKey, id: EntityId) -> Self {
        Self { key, id }
    }

    pub fn of<E: Entity>(record: &E) -> Self {
        Self::new(record.order_key(), record.id())
    }
}

/// Media type of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttachmentType {
    Image,
    Video,
    Audio,
}

impl AttachmentType {
    /// MIME type declared to the upload endpoint.
    pub fn mime(&self) -> &'static str {
        match self {
            AttachmentType::Image => "image/jpeg",
            AttachmentType::Video => "video/mp4",
            AttachmentType::Audio => "audio/mpeg",
        }
    }
}

/// A hosted attachment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AttachmentType,
}

/// Behaviour every cached record kind provides.
///
/// Implementations are plain data; the store drives derived-flag
/// recomputation through [`Entity::refresh_derived`] on every write so the
/// "by me" flags can never drift from set membership.
pub trait Entity:
    Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Kind tag, used in logs, metrics, remote paths and snapshot names.
    const KIND: EntityKind;

    fn id(&self) -> EntityId;

    fn set_id(&mut self, id: EntityId);

    /// Value of the ordering field.
    fn order_key(&self) -> OrderKey;

    /// Owner / author of the record.
    fn owner_id(&self) -> UserId;

    /// Set fields this kind carries, in a fixed order.
    fn set_fields() -> &'static [SetField] {
        &[]
    }

    fn members(&self, _field: SetField) -> Option<&BTreeSet<UserId>> {
        None
    }

    fn members_mut(&mut self, _field: SetField) -> Option<&mut BTreeSet<UserId>> {
        None
    }

    /// Recompute "liked by me", "participated by me", "owned by me".
    fn refresh_derived(&mut self, _viewer: Option<UserId>) {}

    /// Whether the record is released into page windows.
    fn is_visible(&self) -> bool {
        true
    }

    fn set_visible(&mut self, _visible: bool) {}

    fn attachment(&self) -> Option<&Attachment> {
        None
    }

    fn set_attachment(&mut self, _attachment: Option<Attachment>) {}

    /// Parent record for kinds that are removed with their parent.
    fn parent_id(&self) -> Option<EntityId> {
        None
    }

    /// Author previews embedded in the record, stored alongside fetched pages.
    fn author_preview(&self) -> Option<super::kinds::UserPreview> {
        None
    }
}

/// Whether `viewer` is a member of `set`.
pub(crate) fn contains_viewer(set: &BTreeSet<UserId>, viewer: Option<UserId>) -> bool {
    viewer.is_some_and(|v| set.contains(&v))
}
