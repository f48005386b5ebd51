//! Concrete record kinds and their wire schemas.
//!
//! Field names follow the remote JSON schema (camelCase). Derived "by me"
//! flags travel on the wire too, but the store always recomputes them against
//! the local viewer before a record becomes visible.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entity::record::{
    contains_viewer, id_order_key, Attachment, Entity, EntityId, EntityKind, OrderKey, SetField,
    UserId,
};

fn visible_by_default() -> bool {
    true
}

/// A feed post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: EntityId,
    pub author_id: UserId,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_avatar: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Publish time, unix seconds.
    #[serde(default)]
    pub published: i64,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub like_owner_ids: BTreeSet<UserId>,
    #[serde(default)]
    pub mention_ids: BTreeSet<UserId>,
    #[serde(default)]
    pub liked_by_me: bool,
    #[serde(default)]
    pub mentioned_me: bool,
    #[serde(default)]
    pub owned_by_me: bool,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
}

impl Post {
    /// A blank post ready to be filled in and saved.
    pub fn draft(author_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            author_id,
            author: String::new(),
            author_avatar: None,
            content: content.into(),
            published: 0,
            link: None,
            like_owner_ids: BTreeSet::new(),
            mention_ids: BTreeSet::new(),
            liked_by_me: false,
            mentioned_me: false,
            owned_by_me: false,
            attachment: None,
            visible: true,
        }
    }

    pub fn like_count(&self) -> usize {
        self.like_owner_ids.len()
    }
}

impl Entity for Post {
    const KIND: EntityKind = EntityKind::Post;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn order_key(&self) -> OrderKey {
        id_order_key(self.id)
    }

    fn owner_id(&self) -> UserId {
        self.author_id
    }

    fn set_fields() -> &'static [SetField] {
        &[SetField::LikeOwners, SetField::Mentions]
    }

    fn members(&self, field: SetField) -> Option<&BTreeSet<UserId>> {
        match field {
            SetField::LikeOwners => Some(&self.like_owner_ids),
            SetField::Mentions => Some(&self.mention_ids),
            SetField::Participants => None,
        }
    }

    fn members_mut(&mut self, field: SetField) -> Option<&mut BTreeSet<UserId>> {
        match field {
            SetField::LikeOwners => Some(&mut self.like_owner_ids),
            SetField::Mentions => Some(&mut self.mention_ids),
            SetField::Participants => None,
        }
    }

    fn refresh_derived(&mut self, viewer: Option<UserId>) {
        self.liked_by_me = contains_viewer(&self.like_owner_ids, viewer);
        self.mentioned_me = contains_viewer(&self.mention_ids, viewer);
        self.owned_by_me = viewer == Some(self.author_id);
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    fn set_attachment(&mut self, attachment: Option<Attachment>) {
        self.attachment = attachment;
    }

    fn author_preview(&self) -> Option<UserPreview> {
        (self.author_id != 0).then(|| UserPreview {
            id: self.author_id,
            login: None,
            name: self.author.clone(),
            avatar: self.author_avatar.clone(),
        })
    }
}

/// Whether an event takes place online or at a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    #[default]
    Online,
    Offline,
}

/// A scheduled event users can like and participate in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EntityId,
    pub author_id: UserId,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_avatar: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Start time, unix seconds.
    #[serde(default)]
    pub datetime: i64,
    #[serde(default)]
    pub published: i64,
    #[serde(default, rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub like_owner_ids: BTreeSet<UserId>,
    #[serde(default)]
    pub speaker_ids: BTreeSet<UserId>,
    #[serde(default)]
    pub participants_ids: BTreeSet<UserId>,
    #[serde(default)]
    pub liked_by_me: bool,
    #[serde(default)]
    pub participated_by_me: bool,
    #[serde(default)]
    pub owned_by_me: bool,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
}

impl Entity for Event {
    const KIND: EntityKind = EntityKind::Event;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn order_key(&self) -> OrderKey {
        id_order_key(self.id)
    }

    fn owner_id(&self) -> UserId {
        self.author_id
    }

    fn set_fields() -> &'static [SetField] {
        &[SetField::LikeOwners, SetField::Participants]
    }

    fn members(&self, field: SetField) -> Option<&BTreeSet<UserId>> {
        match field {
            SetField::LikeOwners => Some(&self.like_owner_ids),
            SetField::Participants => Some(&self.participants_ids),
            SetField::Mentions => None,
        }
    }

    fn members_mut(&mut self, field: SetField) -> Option<&mut BTreeSet<UserId>> {
        match field {
            SetField::LikeOwners => Some(&mut self.like_owner_ids),
            SetField::Participants => Some(&mut self.participants_ids),
            SetField::Mentions => None,
        }
    }

    fn refresh_derived(&mut self, viewer: Option<UserId>) {
        self.liked_by_me = contains_viewer(&self.like_owner_ids, viewer);
        self.participated_by_me = contains_viewer(&self.participants_ids, viewer);
        self.owned_by_me = viewer == Some(self.author_id);
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    fn set_attachment(&mut self, attachment: Option<Attachment>) {
        self.attachment = attachment;
    }

    fn author_preview(&self) -> Option<UserPreview> {
        (self.author_id != 0).then(|| UserPreview {
            id: self.author_id,
            login: None,
            name: self.author.clone(),
            avatar: self.author_avatar.clone(),
        })
    }
}

/// An entry in a user's employment history. Ordered by start date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: EntityId,
    #[serde(default)]
    pub owner_id: UserId,
    pub name: String,
    #[serde(default)]
    pub position: String,
    /// Unix seconds.
    pub start: i64,
    #[serde(default)]
    pub finish: Option<i64>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub owned_by_me: bool,
}

impl Entity for Job {
    const KIND: EntityKind = EntityKind::Job;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn order_key(&self) -> OrderKey {
        self.start
    }

    fn owner_id(&self) -> UserId {
        self.owner_id
    }

    fn refresh_derived(&mut self, viewer: Option<UserId>) {
        self.owned_by_me = viewer == Some(self.owner_id);
    }
}

/// A comment under a post. Removed together with its post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: EntityId,
    pub post_id: EntityId,
    pub author_id: UserId,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_avatar: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub published: i64,
    #[serde(default)]
    pub like_owner_ids: BTreeSet<UserId>,
    #[serde(default)]
    pub liked_by_me: bool,
    #[serde(default)]
    pub owned_by_me: bool,
}

impl Entity for Comment {
    const KIND: EntityKind = EntityKind::Comment;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn order_key(&self) -> OrderKey {
        id_order_key(self.id)
    }

    fn owner_id(&self) -> UserId {
        self.author_id
    }

    fn set_fields() -> &'static [SetField] {
        &[SetField::LikeOwners]
    }

    fn members(&self, field: SetField) -> Option<&BTreeSet<UserId>> {
        (field == SetField::LikeOwners).then_some(&self.like_owner_ids)
    }

    fn members_mut(&mut self, field: SetField) -> Option<&mut BTreeSet<UserId>> {
        (field == SetField::LikeOwners).then_some(&mut self.like_owner_ids)
    }

    fn refresh_derived(&mut self, viewer: Option<UserId>) {
        self.liked_by_me = contains_viewer(&self.like_owner_ids, viewer);
        self.owned_by_me = viewer == Some(self.author_id);
    }

    fn parent_id(&self) -> Option<EntityId> {
        Some(self.post_id)
    }

    fn author_preview(&self) -> Option<UserPreview> {
        (self.author_id != 0).then(|| UserPreview {
            id: self.author_id,
            login: None,
            name: self.author.clone(),
            avatar: self.author_avatar.clone(),
        })
    }
}

/// Minimal user card shown next to authored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreview {
    pub id: UserId,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Entity for UserPreview {
    const KIND: EntityKind = EntityKind::UserPreview;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn order_key(&self) -> OrderKey {
        self.id
    }

    fn owner_id(&self) -> UserId {
        self.id
    }
}
