//! Windowed reads and network backfill.
//!
//! - [`view`]: [`PagedView`] and position-stable [`Window`]s
//! - [`stream`]: windows as `futures::Stream`s of [`Page`]s
//! - [`mediator`]: REFRESH / PREPEND / APPEND against the remote

pub mod mediator;
pub mod stream;
pub mod view;

pub use mediator::{LoadType, MediatorResult, PagingState, PrependMode, RemoteMediator};
pub use view::{LoadState, LoadStates, Page, PagedView, Window};
