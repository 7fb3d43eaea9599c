use crate::error::SyncError;
use crate::traits::Transport;
use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;

/// Normalized answer of [`Transport::fetch_batch()`].
#[derive(Debug, Clone)]
pub enum BatchResult<E> {
    Single(E),
    Many(Vec<E>),
    /// The remote answered with something that is neither an entity nor a list of entities. The description ends
    /// up in the logs.
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The entity is confirmed to be gone on the remote side.
    NotFound,
    Transient,
}

/// One page of a cursor-paginated feed as returned by the transport.
pub struct Page<T>
where
    T: Transport,
{
    pub items:       Vec<T::Entity>,
    pub users:       Vec<T::User>,
    pub next_cursor: Option<T::Cursor>,
}

impl<T> Debug for Page<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("items", &self.items)
            .field("users", &self.users)
            .field("next_cursor", &self.next_cursor)
            .finish()
    }
}

/// What [`EntitySync::fetch_page()`](crate::EntitySync::fetch_page) reports back.
pub struct PageOutcome<T>
where
    T: Transport,
{
    /// Items of this page, in the order the transport delivered them.
    pub items:     Vec<T::Entity>,
    /// Fewer previously unseen items than requested have arrived. This is a guess, not a server statement.
    pub exhausted: bool,
}

impl<T> Clone for PageOutcome<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            items:     self.items.clone(),
            exhausted: self.exhausted,
        }
    }
}

impl<T> Debug for PageOutcome<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageOutcome")
            .field("items", &self.items)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Logical key of an outstanding transport call.
pub enum RequestKey<T>
where
    T: Transport,
{
    Entity(T::Id),
    Owner(T::Owner, bool),
    /// Region and limit; requests for the same region with different limits are separate.
    Region(T::Region, usize),
    /// `true` for cursor-less "latest" fetches, which don't share a request with cursor-driven ones.
    Feed(T::ListKey, bool),
}

impl<T> Clone for RequestKey<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        match self {
            Self::Entity(id) => Self::Entity(id.clone()),
            Self::Owner(owner, active) => Self::Owner(owner.clone(), *active),
            Self::Region(region, limit) => Self::Region(region.clone(), *limit),
            Self::Feed(key, latest) => Self::Feed(key.clone(), *latest),
        }
    }
}

impl<T> PartialEq for RequestKey<T>
where
    T: Transport,
{
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Entity(a), Self::Entity(b)) => a == b,
            (Self::Owner(a, x), Self::Owner(b, y)) => a == b && x == y,
            (Self::Region(a, x), Self::Region(b, y)) => a == b && x == y,
            (Self::Feed(a, x), Self::Feed(b, y)) => a == b && x == y,
            _ => false,
        }
    }
}

impl<T> Eq for RequestKey<T> where T: Transport {}

impl<T> std::hash::Hash for RequestKey<T>
where
    T: Transport,
{
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Entity(id) => id.hash(state),
            Self::Owner(owner, active) => {
                owner.hash(state);
                active.hash(state);
            }
            Self::Region(region, limit) => {
                region.hash(state);
                limit.hash(state);
            }
            Self::Feed(key, latest) => {
                key.hash(state);
                latest.hash(state);
            }
        }
    }
}

impl<T> Debug for RequestKey<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl<T> Display for RequestKey<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "entity:{id}"),
            Self::Owner(owner, active) => write!(f, "owner:{owner}:{}", if *active { "active" } else { "all" }),
            Self::Region(region, limit) => write!(f, "region:{region}:{limit}"),
            Self::Feed(key, latest) => write!(f, "feed:{key}{}", if *latest { ":latest" } else { "" }),
        }
    }
}

/// What waiters of an in-flight request receive once it settles. By that time the outcome has already been written
/// into the cache. List and feed fetches carry their result along: the slot they write may be overwritten by another
/// request before a waiter gets to read it.
pub enum Settled<T>
where
    T: Transport,
{
    Stored,
    List(Arc<Vec<T::Entity>>),
    Page(Arc<PageOutcome<T>>),
}

impl<T> Clone for Settled<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        match self {
            Self::Stored => Self::Stored,
            Self::List(list) => Self::List(Arc::clone(list)),
            Self::Page(outcome) => Self::Page(Arc::clone(outcome)),
        }
    }
}

impl<T> Debug for Settled<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stored => f.write_str("Settled::Stored"),
            Self::List(list) => f.debug_tuple("Settled::List").field(list).finish(),
            Self::Page(outcome) => f.debug_tuple("Settled::Page").field(outcome).finish(),
        }
    }
}

pub type SettledResult<T> = Result<Settled<T>, SyncError<<T as Transport>::Error>>;
