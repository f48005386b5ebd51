//! Cached record kinds.
//!
//! - [`record`]: ids, cursors, set fields and the [`Entity`] trait
//! - [`kinds`]: Post, Event, Job, Comment, UserPreview

pub mod kinds;
pub mod record;

pub use kinds::{Comment, Event, EventType, Job, Post, UserPreview};
pub use record::{
    Attachment, AttachmentType, Cursor, Direction, Entity, EntityId, EntityKind, OrderKey,
    SetField, UserId,
};
