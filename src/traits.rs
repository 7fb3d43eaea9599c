use async_trait::async_trait;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use crate::types::BatchResult;
use crate::types::ErrorClass;
use crate::types::Page;

/// The remote side of a cache: one implementation per entity type.
///
/// Implementors are expected to be stateless from the cache's point of view. Every associated type is the "shape"
/// of the remote API for this entity type; the cache never looks inside the values except through the methods
/// below.
#[async_trait]
pub trait Transport: Sized + Send + Sync + 'static {
    /// Primary key of an entity. [`Ord`] is required because batch requests are sent with sorted ids.
    type Id: Debug + Display + Hash + Ord + Clone + Eq + Send + Sync + 'static;
    type Entity: Debug + Clone + Send + Sync + 'static;
    /// Key of user-scoped lists, see [`EntitySync::get_by_owner()`](crate::EntitySync::get_by_owner).
    type Owner: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static;
    /// Geo bucket key, see [`EntitySync::get_in_bounds()`](crate::EntitySync::get_in_bounds).
    type Region: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static;
    /// Key of a paginated feed, e.g. a chat room.
    type ListKey: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static;
    /// Opaque continuation token issued by the server.
    type Cursor: Debug + Clone + Send + Sync + 'static;
    type UserId: Debug + Hash + Clone + Eq + Send + Sync + 'static;
    type User: Debug + Clone + Send + Sync + 'static;
    type Error: Display + Debug + Send + Sync + 'static;

    async fn fetch(&self, id: &Self::Id, include_deleted: bool) -> Result<Self::Entity, Self::Error>;

    /// Fetch many entities with one request. The remote may answer with a single object if it decides the
    /// cardinality is one; the implementation reports that with [`BatchResult::Single`].
    async fn fetch_batch(
        &self,
        ids: &[Self::Id],
        include_deleted: bool,
    ) -> Result<BatchResult<Self::Entity>, Self::Error>;

    async fn fetch_by_owner(&self, owner: &Self::Owner, active_only: bool) -> Result<Vec<Self::Entity>, Self::Error>;

    async fn fetch_in_bounds(&self, region: &Self::Region, limit: usize) -> Result<Vec<Self::Entity>, Self::Error>;

    /// A `None` cursor must be treated as "give me the most recent page".
    async fn fetch_page(
        &self,
        list_key: &Self::ListKey,
        cursor: Option<Self::Cursor>,
        limit: usize,
    ) -> Result<Page<Self>, Self::Error>;

    fn id_of(&self, entity: &Self::Entity) -> Self::Id;

    fn user_id_of(&self, user: &Self::User) -> Self::UserId;

    /// Only errors classified as [`ErrorClass::NotFound`] ever remove data from the cache.
    fn classify(&self, _error: &Self::Error) -> ErrorClass {
        ErrorClass::Transient
    }

    // The following methods implement the `has_outcome` derived flag of user-scoped lists. By default entities have
    // no such flag.

    fn has_outcome(&self, _entity: &Self::Entity) -> bool {
        false
    }

    fn mark_outcome(&self, _entity: &mut Self::Entity) {}

    /// Expiry policy for user-scoped list entries. May consult other services, hence async.
    async fn has_expired(&self, _entity: &Self::Entity) -> bool {
        false
    }
}

/// Receives notifications about events the cache handles silently.
#[async_trait]
pub trait Observer<T>: Send + Sync + 'static
where
    T: Transport,
{
    async fn on_evict(&self, _id: &T::Id) {}
    async fn on_error(&self, _error: Arc<T::Error>) {}
    async fn on_warning(&self, _message: &str) {}
}
