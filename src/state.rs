use crate::entry::CacheEntry;
use crate::index::SecondaryIndex;
use crate::inflight::InFlight;
use crate::pagination::Feed;
use crate::traits::Transport;
use crate::types::RequestKey;
use crate::types::SettledResult;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// Everything a cache service mutates lives here, behind one lock. Any read-modify-write of these structures happens
// within a single critical section which never spans an await point.
pub(crate) struct SyncState<T>
where
    T: Transport,
{
    // Results of requests started under an older generation are discarded.
    pub(crate) generation:    u64,
    pub(crate) entries:       HashMap<T::Id, CacheEntry<T>>,
    pub(crate) by_owner:      SecondaryIndex<T::Owner, T>,
    pub(crate) in_bounds:     SecondaryIndex<T::Region, T>,
    pub(crate) feeds:         HashMap<T::ListKey, Feed<T>>,
    pub(crate) requests:      InFlight<RequestKey<T>, SettledResult<T>>,
    pub(crate) revalidations: Vec<JoinHandle<()>>,
}

impl<T> SyncState<T>
where
    T: Transport,
{
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: HashMap::new(),
            by_owner: SecondaryIndex::default(),
            in_bounds: SecondaryIndex::default(),
            feeds: HashMap::new(),
            requests: InFlight::default(),
            revalidations: Vec::new(),
        }
    }

    pub(crate) fn fresh(&self, id: &T::Id, now: Instant, ttl: Duration) -> Option<&CacheEntry<T>> {
        self.entries.get(id).filter(|e| e.is_fresh(now, ttl))
    }

    // Single write path of the primary cache, used by single and batch fetches alike. Lists already holding the
    // entity get the new version too.
    pub(crate) fn store(&mut self, id: T::Id, value: T::Entity, fetched_at: Instant) {
        self.replace_snapshots(&id, &value);
        match self.entries.get_mut(&id) {
            Some(entry) => entry.overwrite(value, fetched_at),
            None => {
                self.entries.insert(id.clone(), CacheEntry::new(id, value, fetched_at));
            }
        }
    }

    /// Remove `id` from the primary cache and every derived view. Returns `true` if anything was removed.
    pub(crate) fn evict(&mut self, id: &T::Id) -> bool {
        let mut removed = self.entries.remove(id).is_some();
        removed |= self.by_owner.evict(id) > 0;
        removed |= self.in_bounds.evict(id) > 0;
        for feed in self.feeds.values_mut() {
            removed |= feed.remove(id);
        }
        removed
    }

    /// Propagate a locally obtained version of an entity into every view already listing it.
    pub(crate) fn replace_snapshots(&mut self, id: &T::Id, value: &T::Entity) {
        self.by_owner.replace(id, value);
        self.in_bounds.replace(id, value);
        for feed in self.feeds.values_mut() {
            feed.replace(id, value);
        }
    }

    pub(crate) fn feed_mut(&mut self, list_key: &T::ListKey) -> &mut Feed<T> {
        self.feeds.entry(list_key.clone()).or_default()
    }

    // Forget handles of detached tasks which are already done.
    pub(crate) fn reap_revalidations(&mut self) {
        self.revalidations.retain(|h| !h.is_finished());
    }
}
