use crate::traits::Transport;
use crate::types::Page;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;

/// Client side of a cursor-paginated feed: the continuation token and everything received so far.
///
/// Items and users are kept in sparse maps keyed by id, so duplicate or out-of-order deliveries merge cleanly and
/// the most recently delivered version of an item wins.
pub struct Feed<T>
where
    T: Transport,
{
    cursor: Option<T::Cursor>,
    items:  BTreeMap<T::Id, T::Entity>,
    users:  HashMap<T::UserId, T::User>,
}

impl<T> Default for Feed<T>
where
    T: Transport,
{
    fn default() -> Self {
        Self {
            cursor: None,
            items:  BTreeMap::new(),
            users:  HashMap::new(),
        }
    }
}

impl<T> Feed<T>
where
    T: Transport,
{
    pub fn cursor(&self) -> Option<&T::Cursor> {
        self.cursor.as_ref()
    }

    pub(crate) fn set_cursor(&mut self, cursor: Option<T::Cursor>) {
        self.cursor = cursor;
    }

    /// Items ordered by id.
    pub fn items(&self) -> Vec<T::Entity> {
        self.items.values().cloned().collect()
    }

    pub fn item(&self, id: &T::Id) -> Option<&T::Entity> {
        self.items.get(id)
    }

    pub fn users(&self) -> Vec<T::User> {
        self.users.values().cloned().collect()
    }

    pub fn user(&self, id: &T::UserId) -> Option<&T::User> {
        self.users.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Merge a page into the feed. Returns how many of its items were not known before. The cursor is left alone.
    pub(crate) fn merge(&mut self, transport: &T, page: &Page<T>) -> usize {
        let mut unseen = 0;
        for item in page.items.iter() {
            if self.items.insert(transport.id_of(item), item.clone()).is_none() {
                unseen += 1;
            }
        }
        for user in page.users.iter() {
            self.users.insert(transport.user_id_of(user), user.clone());
        }
        unseen
    }

    pub(crate) fn remove(&mut self, id: &T::Id) -> bool {
        self.items.remove(id).is_some()
    }

    pub(crate) fn replace(&mut self, id: &T::Id, entity: &T::Entity) -> bool {
        match self.items.get_mut(id) {
            Some(item) => {
                *item = entity.clone();
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear_items(&mut self) {
        self.items.clear();
    }
}

impl<T> Debug for Feed<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("cursor", &self.cursor)
            .field("items", &self.items)
            .field("users", &self.users)
            .finish()
    }
}
