//! # entity-sync
//!
//! Client-side synchronization layer between UI consumers and a remote API, instantiated once per entity type.
//!
//! Think of it as an in-memory view of remote records that tries hard not to ask the remote twice for the same
//! thing.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Records are fetched by id from a remote API, one by one or in batches.
//! - The same records are asked for concurrently by independent parts of the application.
//! - Some views are lists derived from the records: lists of a user, records within a geo bucket, chat-like feeds
//!   paginated with server-issued cursors.
//!
//! The cache operates on the following principles:
//!
//! - It is transport-agnostic: everything remote goes through a [`Transport`] implementation.
//! - At most one request per logical key is in flight at any moment; concurrent callers share it.
//! - Entities are fresh for a TTL (10 minutes by default) measured from the moment the data arrived.
//! - Batch requests are coalesced: one call for all ids not cached and not already requested.
//! - User lists are served stale-while-revalidate when that's allowed.
//! - Only a confirmed deletion removes data; network failures never do. A deleted entity disappears from the
//!   primary cache and from all derived lists in one step.
//! - There is no eviction by size. This is a session cache, not a general-purpose one.
//!
//! # Transport
//!
//! The transport is not only the remote API adapter but also the type that, through its associated types, defines
//! ids, entities, owners, regions, feed keys, cursors and errors for a cache instance. It also classifies errors:
//! only [`ErrorClass::NotFound`](types::ErrorClass::NotFound) leads to eviction.
//!
//! # Requests in flight
//!
//! Every transport call runs in its own task and writes its outcome into the cache before any waiter is woken up.
//! Hence a caller arriving after a request settled always finds the data in the cache, and a request completes even
//! if all its callers went away.

pub mod cache;
pub mod entry;
pub mod error;
pub mod index;
pub mod inflight;
pub mod pagination;
pub(crate) mod state;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::EntitySync;
#[doc(inline)]
pub use error::SyncError;
#[doc(inline)]
pub use traits::Transport;

pub mod prelude {
    pub use crate::cache::EntitySync;
    pub use crate::error::SyncError;
    pub use crate::traits::Observer;
    pub use crate::traits::Transport;
    pub use crate::types::*;
}
