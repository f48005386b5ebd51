//! Durable keyed storage for cached records.
//!
//! - [`table`]: the transactional [`EntityStore`] for one kind
//! - [`relations`]: `(parent, user)` association index for set fields
//! - [`snapshot`]: on-disk snapshots (JSON, optionally zstd-compressed)

pub mod relations;
pub mod snapshot;
pub mod table;

pub use table::{EntityStore, StoreError, Transaction};
