//! Optimistic mutations.
//!
//! - [`delta`]: operations, local deltas and their exact inverses
//! - [`coordinator`]: the apply / call remote / commit-or-rollback protocol

pub mod coordinator;
pub mod delta;

pub use coordinator::{CascadeDelete, CoordinatorBuilder, MutationCoordinator};
pub use delta::{LocalDelta, Mutation, OpFamily, OperationKind, PendingAttachment};
