//! feed-sync: offline-first paginated entity cache.
//!
//! Records fetched from a remote API are cached in a local transactional
//! store and served as position-stable windows. A mediator backfills the
//! store on REFRESH / PREPEND / APPEND, mutations are applied optimistically
//! and rolled back on failure, and a background watch stages newer items
//! until the reader asks to see them.

pub mod auth;
pub mod config;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod mutation;
pub mod paging;
pub mod remote;
pub mod repository;
pub mod server;
pub mod store;

pub use error::{MutationError, SyncError};
pub use repository::{Repository, RepositoryBuilder};
