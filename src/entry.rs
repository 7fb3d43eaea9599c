use crate::traits::Transport;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// A primary cache record.
pub struct CacheEntry<T>
where
    T: Transport,
{
    id:         T::Id,
    value:      T::Entity,
    fetched_at: Instant,
}

impl<T> CacheEntry<T>
where
    T: Transport,
{
    /// `fetched_at` is the moment the data arrived, not when it was requested.
    pub(crate) fn new(id: T::Id, value: T::Entity, fetched_at: Instant) -> Self {
        Self { id, value, fetched_at }
    }

    pub fn id(&self) -> &T::Id {
        &self.id
    }

    pub fn value(&self) -> &T::Entity {
        &self.value
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn into_value(self) -> T::Entity {
        self.value
    }

    /// Age is rounded to whole seconds; an entry exactly `ttl` old is still fresh.
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        let age = now.saturating_duration_since(self.fetched_at).as_secs_f64().round() as u64;
        age <= ttl.as_secs()
    }

    // fetched_at never goes backwards for a given id.
    pub(crate) fn overwrite(&mut self, value: T::Entity, fetched_at: Instant) {
        self.value = value;
        self.fetched_at = self.fetched_at.max(fetched_at);
    }
}

impl<T> Clone for CacheEntry<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            id:         self.id.clone(),
            value:      self.value.clone(),
            fetched_at: self.fetched_at,
        }
    }
}

impl<T> Debug for CacheEntry<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("value", &self.value)
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}
