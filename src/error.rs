use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

/// Errors of [`EntitySync`](crate::EntitySync) operations.
///
/// One transport failure is delivered to every caller waiting on the same request, hence the transport error is
/// kept behind an [`Arc`] and the whole type is cheap to clone.
#[derive(Debug, Error)]
pub enum SyncError<E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    /// The entity has been deleted on the remote side. It is already evicted by the time this is returned.
    #[error("entity {0} no longer exists")]
    NotFound(String),

    #[error("transport failure: {0}")]
    Transport(Arc<E>),

    /// The task serving an in-flight request has gone away without settling it.
    #[error("request {0} was dropped before it settled")]
    Dropped(String),

    #[error("cache service is shut down")]
    Gone,
}

impl<E> Clone for SyncError<E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::NotFound(id) => Self::NotFound(id.clone()),
            Self::Transport(err) => Self::Transport(Arc::clone(err)),
            Self::Dropped(key) => Self::Dropped(key.clone()),
            Self::Gone => Self::Gone,
        }
    }
}

impl<E> SyncError<E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The transport error behind this one, if any.
    pub fn transport_error(&self) -> Option<&Arc<E>> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}
