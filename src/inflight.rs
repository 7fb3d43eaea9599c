use futures::future::FutureExt;
use futures::future::Shared;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::oneshot;

/// A clonable future resolving once the request it stands for settles.
pub type InFlightHandle<V> = Shared<oneshot::Receiver<V>>;

pub(crate) enum Acquired<V>
where
    V: Clone,
{
    /// Somebody else is already running the request; just wait for it.
    AlreadyPending(InFlightHandle<V>),
    Started(InFlightHandle<V>),
}

impl<V> Acquired<V>
where
    V: Clone,
{
    pub(crate) fn already_pending(&self) -> bool {
        matches!(self, Self::AlreadyPending(_))
    }

    pub(crate) fn into_handle(self) -> InFlightHandle<V> {
        match self {
            Self::AlreadyPending(h) | Self::Started(h) => h,
        }
    }
}

/// The sending half of a request registration, given to whoever performs the request.
#[derive(Debug)]
pub(crate) struct Ticket<V> {
    pub(crate) serial: u64,
    pub(crate) sender: oneshot::Sender<V>,
}

impl<V> Ticket<V> {
    /// Wake all waiters. Nobody listening is not an error: callers are free to stop awaiting.
    pub(crate) fn settle(self, outcome: V) {
        let _ = self.sender.send(outcome);
    }
}

struct Registration<V>
where
    V: Clone,
{
    serial: u64,
    handle: InFlightHandle<V>,
}

/// Tracks outstanding requests by key so that concurrent callers share one transport call.
///
/// The tracker does not run anything itself. `acquire` hands out a [`Ticket`] for a new registration; its holder
/// must perform the request, write the result wherever it belongs, [`release`](Self::release) the keys and
/// [`settle`](Ticket::settle) the ticket.
pub(crate) struct InFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pending:     HashMap<K, Registration<V>>,
    next_serial: u64,
}

impl<K, V> Default for InFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self {
            pending:     HashMap::new(),
            next_serial: 0,
        }
    }
}

impl<K, V> InFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn new_ticket(&mut self) -> (Ticket<V>, InFlightHandle<V>) {
        let (sender, receiver) = oneshot::channel();
        self.next_serial += 1;
        (
            Ticket {
                serial: self.next_serial,
                sender,
            },
            receiver.shared(),
        )
    }

    pub(crate) fn lookup(&self, key: &K) -> Option<InFlightHandle<V>> {
        self.pending.get(key).map(|r| r.handle.clone())
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Attach to a pending request under `key` or register a new one. `start` receives the ticket of the new
    /// registration and is expected to launch the request.
    pub(crate) fn acquire<F>(&mut self, key: K, start: F) -> Acquired<V>
    where
        F: FnOnce(Ticket<V>),
    {
        if let Some(handle) = self.lookup(&key) {
            return Acquired::AlreadyPending(handle);
        }

        let (ticket, handle) = self.new_ticket();
        self.pending.insert(
            key,
            Registration {
                serial: ticket.serial,
                handle: handle.clone(),
            },
        );
        start(ticket);
        Acquired::Started(handle)
    }

    /// Register one shared handle under every key which has no pending registration. Returns `None` when there is
    /// nothing left to request.
    ///
    /// Keys with a fresh cache entry must be filtered out by the caller since the tracker knows nothing about the
    /// cache.
    pub(crate) fn acquire_batch<F>(&mut self, keys: Vec<K>, start: F) -> Option<InFlightHandle<V>>
    where
        F: FnOnce(Vec<K>, Ticket<V>),
    {
        let mut keys = keys;
        keys.retain(|k| !self.pending.contains_key(k));
        if keys.is_empty() {
            return None;
        }

        let (ticket, handle) = self.new_ticket();
        for key in keys.iter() {
            self.pending.insert(
                key.clone(),
                Registration {
                    serial: ticket.serial,
                    handle: handle.clone(),
                },
            );
        }
        start(keys, ticket);
        Some(handle)
    }

    /// Drop registrations of the given keys, but only those still belonging to request `serial`.
    pub(crate) fn release<'a, I>(&mut self, keys: I, serial: u64)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        for key in keys {
            if self.pending.get(key).is_some_and(|r| r.serial == serial) {
                self.pending.remove(key);
            }
        }
    }
}
