use crate::traits::Transport;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// An ordered list of entities under a derived key, as delivered by a list request.
///
/// Entries are derived data. The primary cache stays the source of truth for content; an id listed here may have no
/// primary entry at all.
pub struct IndexEntry<T>
where
    T: Transport,
{
    active_only: bool,
    items:       Vec<(T::Id, T::Entity)>,
}

impl<T> IndexEntry<T>
where
    T: Transport,
{
    pub(crate) fn new(transport: &T, active_only: bool, entities: Vec<T::Entity>) -> Self {
        let items = entities.into_iter().map(|e| (transport.id_of(&e), e)).collect();
        Self { active_only, items }
    }

    /// Whether the list was fetched with the "active only" filter.
    pub fn active_only(&self) -> bool {
        self.active_only
    }

    pub fn ids(&self) -> impl Iterator<Item = &T::Id> {
        self.items.iter().map(|(id, _)| id)
    }

    pub fn entities(&self) -> Vec<T::Entity> {
        self.items.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.items.iter().any(|(i, _)| i == id)
    }

    pub(crate) fn remove(&mut self, id: &T::Id) -> bool {
        let before = self.items.len();
        self.items.retain(|(i, _)| i != id);
        before != self.items.len()
    }

    /// Replace the snapshot of `id` in place, keeping its position.
    pub(crate) fn replace(&mut self, id: &T::Id, entity: &T::Entity) -> bool {
        let mut replaced = false;
        for (i, e) in self.items.iter_mut() {
            if i == id {
                *e = entity.clone();
                replaced = true;
            }
        }
        replaced
    }
}

impl<T> Clone for IndexEntry<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            active_only: self.active_only,
            items:       self.items.clone(),
        }
    }
}

impl<T> Debug for IndexEntry<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEntry")
            .field("active_only", &self.active_only)
            .field("items", &self.items)
            .finish()
    }
}

/// A family of [`IndexEntry`] records keyed by owner, geo bucket, or similar.
pub(crate) struct SecondaryIndex<K, T>
where
    K: Hash + Eq,
    T: Transport,
{
    entries: HashMap<K, IndexEntry<T>>,
}

impl<K, T> Default for SecondaryIndex<K, T>
where
    K: Hash + Eq,
    T: Transport,
{
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, T> SecondaryIndex<K, T>
where
    K: Hash + Eq,
    T: Transport,
{
    pub(crate) fn get(&self, key: &K) -> Option<&IndexEntry<T>> {
        self.entries.get(key)
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn insert(&mut self, key: K, entry: IndexEntry<T>) {
        self.entries.insert(key, entry);
    }

    /// Drop `id` from every entry. Returns the number of entries it was removed from.
    pub(crate) fn evict(&mut self, id: &T::Id) -> usize {
        self.entries.values_mut().filter_map(|e| e.remove(id).then_some(())).count()
    }

    pub(crate) fn replace(&mut self, id: &T::Id, entity: &T::Entity) -> usize {
        self.entries
            .values_mut()
            .filter_map(|e| e.replace(id, entity).then_some(()))
            .count()
    }
}
