//! Local HTTP API exposing the repositories.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: SSE streaming of window snapshots

pub mod api;
pub mod streaming;
