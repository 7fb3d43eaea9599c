use crate::error::SyncError;
use crate::index::IndexEntry;
use crate::inflight::InFlightHandle;
use crate::inflight::Ticket;
use crate::prelude::*;
use crate::state::SyncState;
use fieldx_plus::fx_plus;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;
use tracing::Instrument;

type SyncResult<T, V> = Result<V, SyncError<<T as Transport>::Error>>;
type SettleTicket<T> = Ticket<SettledResult<T>>;

/// The entity synchronization service. One instance per entity type and session.
///
/// ```ignore
/// let messages = EntitySync::builder()
///     .transport(MessageApi::new(client))
///     .name("message")
///     .ttl(Duration::from_secs(600))
///     .build()?;
///
/// // Served from memory while fresh, fetched once no matter how many callers ask concurrently.
/// let message = messages.get(&id, false).await?;
///
/// // One request for everything not cached yet.
/// messages.get_multiple(&ids, false).await?;
///
/// // Cached list right away, refreshed in the background.
/// let mine = messages.get_by_owner(&me, true, false).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`EntitySync`].", "", "See [`EntitySync::builder()`] method."),
        method_doc("Implement builder pattern for [`EntitySync`]."),
    )
)]
pub struct EntitySync<T>
where
    T: Transport,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    transport: Arc<T>,

    /// Cache name. Only used for logging.
    #[fieldx(get(copy), default("entity"))]
    name: &'static str,

    /// How long a fetched entity is served from memory.
    #[fieldx(get(copy), default(Duration::from_secs(600)))]
    ttl: Duration,

    /// Passed to single and batch fetches.
    #[fieldx(get(copy), default(false))]
    include_deleted: bool,

    /// Number of items requested by [`fetch_latest()`](Self::fetch_latest).
    #[fieldx(get(copy), default(10))]
    page_size: usize,

    #[fieldx(get, default(Vec::new()))]
    observers: Vec<Arc<dyn Observer<T>>>,

    #[fieldx(private, lazy, lock, get_mut, builder(off))]
    state: SyncState<T>,
}

impl<T> EntitySync<T>
where
    T: Transport,
{
    fn build_state(&self) -> SyncState<T> {
        SyncState::new(0)
    }

    fn myself_or_gone(&self) -> SyncResult<T, Arc<Self>> {
        self.myself().ok_or(SyncError::Gone)
    }

    async fn wait(label: impl Display, handle: InFlightHandle<SettledResult<T>>) -> SettledResult<T> {
        match handle.await {
            Ok(settled) => settled,
            Err(_) => Err(SyncError::Dropped(label.to_string())),
        }
    }

    /// Get an entity by id.
    ///
    /// A fresh cache entry is returned without touching the transport. Otherwise the caller either joins a request
    /// already in flight for the id (a single fetch or a batch covering it) or starts a new one. `force_refresh`
    /// skips the freshness check but still joins a pending request.
    ///
    /// If the remote reports the entity gone, it is evicted everywhere and [`SyncError::NotFound`] is returned.
    #[instrument(level = "trace", skip(self), fields(cache = self.name()))]
    pub async fn get(&self, id: &T::Id, force_refresh: bool) -> SyncResult<T, T::Entity> {
        tracing::debug!("[{}] GET({id})", self.name());

        let myself = self.myself_or_gone()?;
        let key = RequestKey::<T>::Entity(id.clone());
        let mut force = force_refresh;
        let mut attempts = 0;

        loop {
            let handle = {
                let mut state = self.state_mut();

                if !force {
                    if let Some(entry) = state.fresh(id, Instant::now(), self.ttl()) {
                        return Ok(entry.value().clone());
                    }
                }

                let generation = state.generation;
                let acquired = state.requests.acquire(key.clone(), |ticket| {
                    Arc::clone(&myself).spawn_fetch(id.clone(), generation, ticket)
                });
                if acquired.already_pending() {
                    tracing::trace!("[{}] joining pending request for {id}", self.name());
                }
                acquired.into_handle()
            };

            Self::wait(&key, handle).await?;
            attempts += 1;

            if let Some(entry) = self.state().entries.get(id) {
                return Ok(entry.value().clone());
            }

            // We've been waiting for a batch which came back without this id. Ask for it alone, but only once.
            if attempts > 1 {
                return Err(SyncError::NotFound(id.to_string()));
            }
            force = true;
        }
    }

    /// Make sure all `ids` are cached, requesting everything stale or missing with a single batch call. Ids which
    /// are already being fetched by someone else are waited for, not requested again.
    ///
    /// Ids missing from the response are silently skipped, and so is a response of unexpected shape. Only a
    /// transport failure of our own batch is reported.
    #[instrument(level = "trace", skip(self), fields(cache = self.name()))]
    pub async fn get_multiple(&self, ids: &[T::Id], force_refresh: bool) -> SyncResult<T, ()> {
        let myself = self.myself_or_gone()?;
        let requested = ids.iter().cloned().collect::<BTreeSet<_>>();

        let (own, others) = {
            let mut guard = self.state_mut();
            let state = &mut *guard;
            let now = Instant::now();
            let ttl = self.ttl();

            let mut others = Vec::new();
            let mut wanted = Vec::new();
            for id in requested {
                let key = RequestKey::<T>::Entity(id.clone());
                if let Some(handle) = state.requests.lookup(&key) {
                    others.push(handle);
                }
                else if force_refresh || state.fresh(&id, now, ttl).is_none() {
                    wanted.push(key);
                }
            }

            let generation = state.generation;
            let own = state.requests.acquire_batch(wanted, |keys, ticket| {
                Arc::clone(&myself).spawn_batch(keys, generation, ticket)
            });
            (own, others)
        };

        if let Some(handle) = own {
            Self::wait("batch", handle).await?;
        }

        // Failures of requests started elsewhere belong to their own callers.
        join_all(others).await;

        Ok(())
    }

    /// The list of entities of `owner`.
    ///
    /// When an "active only" list is requested without forcing and a list is already cached for the owner, the
    /// cached list is returned right away while a refresh runs in the background. Its outcome replaces the cached
    /// list silently; a failure leaves the old list in place. Every other request waits for the transport.
    #[instrument(level = "trace", skip(self), fields(cache = self.name()))]
    pub async fn get_by_owner(
        &self,
        owner: &T::Owner,
        active_only: bool,
        force_refresh: bool,
    ) -> SyncResult<T, Vec<T::Entity>> {
        let myself = self.myself_or_gone()?;
        let key = RequestKey::<T>::Owner(owner.clone(), active_only);

        let handle = {
            let mut guard = self.state_mut();
            let state = &mut *guard;
            state.reap_revalidations();
            let generation = state.generation;

            let cached = state.by_owner.get(owner).map(|e| e.entities());
            match cached {
                Some(list) if active_only && !force_refresh => {
                    tracing::debug!("[{}] serving cached list of {owner}, revalidating", self.name());
                    let mut spawned = None;
                    state.requests.acquire(key, |ticket| {
                        spawned = Some(Arc::clone(&myself).spawn_owner_list(
                            owner.clone(),
                            active_only,
                            generation,
                            true,
                            ticket,
                        ));
                    });
                    state.revalidations.extend(spawned);
                    return Ok(list);
                }
                _ => state
                    .requests
                    .acquire(key.clone(), |ticket| {
                        Arc::clone(&myself).spawn_owner_list(owner.clone(), active_only, generation, false, ticket);
                    })
                    .into_handle(),
            }
        };

        match Self::wait(&key, handle).await? {
            Settled::List(list) => Ok((*list).clone()),
            _ => Err(SyncError::Dropped(key.to_string())),
        }
    }

    /// Entities within a geo bucket. With `use_cache` a previously fetched list is returned as is, whatever limit it
    /// was fetched with; otherwise the region is fetched and the stored list replaced.
    ///
    /// Concurrent requests share a transport call only when both the region and the limit match.
    #[instrument(level = "trace", skip(self), fields(cache = self.name()))]
    pub async fn get_in_bounds(
        &self,
        region: &T::Region,
        limit: usize,
        use_cache: bool,
    ) -> SyncResult<T, Vec<T::Entity>> {
        let myself = self.myself_or_gone()?;
        let key = RequestKey::<T>::Region(region.clone(), limit);

        let handle = {
            let mut state = self.state_mut();
            if use_cache {
                if let Some(entry) = state.in_bounds.get(region) {
                    return Ok(entry.entities());
                }
            }

            let generation = state.generation;
            state
                .requests
                .acquire(key.clone(), |ticket| {
                    Arc::clone(&myself).spawn_region(region.clone(), limit, generation, ticket)
                })
                .into_handle()
        };

        match Self::wait(&key, handle).await? {
            Settled::List(list) => Ok((*list).clone()),
            _ => Err(SyncError::Dropped(key.to_string())),
        }
    }

    /// Fetch the next page of a feed, continuing from the cursor stored by the previous call. The first call, or one
    /// following [`reset_cursor()`](Self::reset_cursor), gets the most recent page.
    ///
    /// Received items are merged into the feed and the returned continuation token is stored for the next call.
    ///
    /// A call made while a page of the same feed is already being fetched waits for that page instead of requesting
    /// another one. It gets that page as is, `exhausted` included, even if it asked for a different `limit`.
    pub async fn fetch_page(&self, list_key: &T::ListKey, limit: usize) -> SyncResult<T, PageOutcome<T>> {
        self.fetch_feed(list_key, limit, false).await
    }

    /// Fetch the most recent page of a feed regardless of the stored cursor, which is left untouched. Useful right
    /// after posting into the feed.
    pub async fn fetch_latest(&self, list_key: &T::ListKey) -> SyncResult<T, PageOutcome<T>> {
        self.fetch_feed(list_key, self.page_size(), true).await
    }

    #[instrument(level = "trace", skip(self), fields(cache = self.name()))]
    async fn fetch_feed(&self, list_key: &T::ListKey, limit: usize, latest: bool) -> SyncResult<T, PageOutcome<T>> {
        let myself = self.myself_or_gone()?;
        let key = RequestKey::<T>::Feed(list_key.clone(), latest);

        let handle = {
            let mut guard = self.state_mut();
            let state = &mut *guard;
            let generation = state.generation;
            let cursor = if latest {
                None
            }
            else {
                state.feeds.get(list_key).and_then(|f| f.cursor().cloned())
            };

            state
                .requests
                .acquire(key.clone(), |ticket| {
                    Arc::clone(&myself).spawn_feed(list_key.clone(), cursor, limit, latest, generation, ticket)
                })
                .into_handle()
        };

        match Self::wait(&key, handle).await? {
            Settled::Page(outcome) => Ok((*outcome).clone()),
            _ => Err(SyncError::Dropped(key.to_string())),
        }
    }

    /// Drop an entity from the cache and from every list and feed holding it. Returns `false` if there was nothing
    /// to drop.
    pub fn evict(&self, id: &T::Id) -> bool {
        let removed = self.state_mut().evict(id);
        tracing::debug!("[{}] EVICT({id}) removed={removed}", self.name());
        removed
    }

    /// Forget everything, e.g. on sign-out. Requests still in flight, background refreshes included, run to
    /// completion and settle their waiters, but nothing they fetched is written into the new state.
    pub fn invalidate_all(&self) {
        let previous = {
            let mut state = self.state_mut();
            let generation = state.generation + 1;
            std::mem::replace(&mut *state, SyncState::new(generation))
        };

        tracing::info!(
            "[{}] invalidated; entries={} pending={}",
            self.name(),
            previous.entries.len(),
            previous.requests.len()
        );
    }

    /// Store an entity obtained outside of this cache, e.g. returned by an update call. It counts as freshly
    /// fetched, and lists or feeds already holding it get the new version.
    pub fn put(&self, entity: T::Entity) {
        let id = self.transport().id_of(&entity);
        tracing::debug!("[{}] PUT({id})", self.name());
        self.state_mut().store(id, entity, Instant::now());
    }

    /// Drop the primary entry of `id` only. Lists keep showing it until they're refreshed.
    pub fn remove(&self, id: &T::Id) -> Option<T::Entity> {
        self.state_mut().entries.remove(id).map(|e| e.into_value())
    }

    /// The cached entity, fresh or not. Never touches the transport.
    pub fn peek(&self, id: &T::Id) -> Option<T::Entity> {
        self.state().entries.get(id).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<T::Entity> {
        self.state().entries.values().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Cached list of `owner` as is; empty if never fetched.
    pub fn owner_list(&self, owner: &T::Owner) -> Vec<T::Entity> {
        self.state()
            .by_owner
            .get(owner)
            .map(|e| e.entities())
            .unwrap_or_default()
    }

    pub fn has_owner_list(&self, owner: &T::Owner) -> bool {
        self.state().by_owner.contains_key(owner)
    }

    pub fn region_list(&self, region: &T::Region) -> Vec<T::Entity> {
        self.state()
            .in_bounds
            .get(region)
            .map(|e| e.entities())
            .unwrap_or_default()
    }

    /// Items received for a feed so far, ordered by id.
    pub fn feed_items(&self, list_key: &T::ListKey) -> Vec<T::Entity> {
        self.state()
            .feeds
            .get(list_key)
            .map(|f| f.items())
            .unwrap_or_default()
    }

    pub fn feed_users(&self, list_key: &T::ListKey) -> Vec<T::User> {
        self.state()
            .feeds
            .get(list_key)
            .map(|f| f.users())
            .unwrap_or_default()
    }

    pub fn cursor(&self, list_key: &T::ListKey) -> Option<T::Cursor> {
        self.state().feeds.get(list_key).and_then(|f| f.cursor().cloned())
    }

    /// Forget the continuation token; the next [`fetch_page()`](Self::fetch_page) starts from the most recent page.
    pub fn reset_cursor(&self, list_key: &T::ListKey) {
        if let Some(feed) = self.state_mut().feeds.get_mut(list_key) {
            feed.set_cursor(None);
        }
    }

    /// Drop all items received for a feed. The cursor is kept.
    pub fn clear_feed(&self, list_key: &T::ListKey) {
        if let Some(feed) = self.state_mut().feeds.get_mut(list_key) {
            feed.clear_items();
        }
    }

    pub fn drop_feed_item(&self, list_key: &T::ListKey, id: &T::Id) -> bool {
        self.state_mut()
            .feeds
            .get_mut(list_key)
            .is_some_and(|f| f.remove(id))
    }

    /// Number of requests currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.state().requests.len()
    }

    /// Wait for all background list refreshes started so far.
    pub async fn join_revalidations(&self) {
        let handles = std::mem::take(&mut self.state_mut().revalidations);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!("[{}] revalidation task failed: {err}", self.name());
            }
        }
    }

    /// Wait for background refreshes, then drop all cached data.
    pub async fn close(&self) {
        self.join_revalidations().await;
        self.invalidate_all();
        tracing::debug!("[{}] closed", self.name());
    }

    fn spawn_fetch(self: Arc<Self>, id: T::Id, generation: u64, ticket: SettleTicket<T>) {
        let span = tracing::debug_span!("fetch", cache = self.name(), %id);
        tokio::spawn(
            async move {
                let result = self.transport().fetch(&id, self.include_deleted()).await;
                let (settled, evicted) = self.settle_fetch(&id, generation, ticket.serial, result);
                if evicted {
                    for observer in self.observers().iter() {
                        observer.on_evict(&id).await;
                    }
                }
                ticket.settle(settled);
            }
            .instrument(span),
        );
    }

    // The flag tells whether a confirmed deletion actually removed anything.
    fn settle_fetch(
        &self,
        id: &T::Id,
        generation: u64,
        serial: u64,
        result: Result<T::Entity, T::Error>,
    ) -> (SettledResult<T>, bool) {
        let key = RequestKey::<T>::Entity(id.clone());
        let mut state = self.state_mut();
        let current = state.generation == generation;
        if current {
            state.requests.release([&key], serial);
        }

        match result {
            Ok(entity) => {
                if current {
                    state.store(id.clone(), entity, Instant::now());
                }
                (Ok(Settled::Stored), false)
            }
            Err(err) => match self.transport().classify(&err) {
                ErrorClass::NotFound => {
                    tracing::debug!("[{}] {id} is gone: {err}", self.name());
                    // Results of a previous session have nothing to evict from.
                    let evicted = current && state.evict(id);
                    (Err(SyncError::NotFound(id.to_string())), evicted)
                }
                ErrorClass::Transient => {
                    tracing::debug!("[{}] fetching {id} failed: {err}", self.name());
                    (Err(SyncError::Transport(Arc::new(err))), false)
                }
            },
        }
    }

    fn spawn_batch(self: Arc<Self>, keys: Vec<RequestKey<T>>, generation: u64, ticket: SettleTicket<T>) {
        let ids = keys
            .iter()
            .filter_map(|k| match k {
                RequestKey::Entity(id) => Some(id.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let batch_key = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        let span = tracing::debug_span!("fetch_batch", cache = self.name(), ids = %batch_key);

        tokio::spawn(
            async move {
                let transport = self.transport();
                let outcome = match transport.fetch_batch(&ids, self.include_deleted()).await {
                    Ok(BatchResult::Many(entities)) => Ok(entities),
                    Ok(BatchResult::Single(entity)) => Ok(vec![entity]),
                    Ok(BatchResult::Malformed(what)) => {
                        let message = format!("[{}] unexpected batch response for {batch_key}: {what}", self.name());
                        tracing::warn!("{message}");
                        for observer in self.observers().iter() {
                            observer.on_warning(&message).await;
                        }
                        Ok(Vec::new())
                    }
                    Err(err) => match transport.classify(&err) {
                        // There is no telling which of the ids is gone.
                        ErrorClass::NotFound => {
                            tracing::debug!("[{}] batch {batch_key} not found: {err}", self.name());
                            Ok(Vec::new())
                        }
                        ErrorClass::Transient => Err(SyncError::Transport(Arc::new(err))),
                    },
                };

                let settled = {
                    let mut state = self.state_mut();
                    let current = state.generation == generation;
                    if current {
                        state.requests.release(keys.iter(), ticket.serial);
                    }
                    outcome.map(|entities| {
                        if current {
                            let now = Instant::now();
                            for entity in entities {
                                state.store(transport.id_of(&entity), entity, now);
                            }
                        }
                        Settled::Stored
                    })
                };
                ticket.settle(settled);
            }
            .instrument(span),
        );
    }

    fn spawn_owner_list(
        self: Arc<Self>,
        owner: T::Owner,
        active_only: bool,
        generation: u64,
        background: bool,
        ticket: SettleTicket<T>,
    ) -> JoinHandle<()> {
        let span = tracing::debug_span!("owner_list", cache = self.name(), %owner, active_only, background);
        tokio::spawn(
            async move {
                let transport = self.transport();
                let result = match transport.fetch_by_owner(&owner, active_only).await {
                    Ok(mut entities) => {
                        derive_outcomes(&*transport, &mut entities).await;
                        Ok(entities)
                    }
                    Err(err) => Err(SyncError::Transport(Arc::new(err))),
                };

                let settled = {
                    let key = RequestKey::<T>::Owner(owner.clone(), active_only);
                    let mut state = self.state_mut();
                    let current = state.generation == generation;
                    if current {
                        state.requests.release([&key], ticket.serial);
                    }
                    result.map(|entities| {
                        if current {
                            state
                                .by_owner
                                .insert(owner.clone(), IndexEntry::new(&transport, active_only, entities.clone()));
                        }
                        Settled::List(Arc::new(entities))
                    })
                };

                if background {
                    if let Err(ref err) = settled {
                        self.report_background_failure(err).await;
                    }
                }
                ticket.settle(settled);
            }
            .instrument(span),
        )
    }

    fn spawn_region(self: Arc<Self>, region: T::Region, limit: usize, generation: u64, ticket: SettleTicket<T>) {
        let span = tracing::debug_span!("in_bounds", cache = self.name(), %region, limit);
        tokio::spawn(
            async move {
                let transport = self.transport();
                let result = transport.fetch_in_bounds(&region, limit).await;

                let settled = {
                    let key = RequestKey::<T>::Region(region.clone(), limit);
                    let mut state = self.state_mut();
                    let current = state.generation == generation;
                    if current {
                        state.requests.release([&key], ticket.serial);
                    }
                    match result {
                        Ok(entities) => {
                            if current {
                                state
                                    .in_bounds
                                    .insert(region.clone(), IndexEntry::new(&transport, false, entities.clone()));
                            }
                            Ok(Settled::List(Arc::new(entities)))
                        }
                        Err(err) => Err(SyncError::Transport(Arc::new(err))),
                    }
                };
                ticket.settle(settled);
            }
            .instrument(span),
        );
    }

    fn spawn_feed(
        self: Arc<Self>,
        list_key: T::ListKey,
        cursor: Option<T::Cursor>,
        limit: usize,
        latest: bool,
        generation: u64,
        ticket: SettleTicket<T>,
    ) {
        let span = tracing::debug_span!("fetch_page", cache = self.name(), %list_key, limit, latest);
        tokio::spawn(
            async move {
                let transport = self.transport();
                let result = transport.fetch_page(&list_key, cursor, limit).await;

                let settled = {
                    let key = RequestKey::<T>::Feed(list_key.clone(), latest);
                    let mut state = self.state_mut();
                    let current = state.generation == generation;
                    if current {
                        state.requests.release([&key], ticket.serial);
                    }
                    match result {
                        Ok(page) => {
                            let unseen = if current {
                                let feed = state.feed_mut(&list_key);
                                let unseen = feed.merge(&transport, &page);
                                if !latest {
                                    feed.set_cursor(page.next_cursor.clone());
                                }
                                unseen
                            }
                            else {
                                page.items.len()
                            };
                            tracing::trace!(
                                "[{}] page of {list_key}: received={} unseen={unseen}",
                                self.name(),
                                page.items.len()
                            );
                            Ok(Settled::Page(Arc::new(PageOutcome {
                                exhausted: unseen < limit,
                                items:     page.items,
                            })))
                        }
                        Err(err) => Err(SyncError::Transport(Arc::new(err))),
                    }
                };
                ticket.settle(settled);
            }
            .instrument(span),
        );
    }

    async fn report_background_failure(&self, err: &SyncError<T::Error>) {
        tracing::warn!("[{}] background refresh failed: {err}", self.name());
        for observer in self.observers().iter() {
            match err.transport_error() {
                Some(transport_error) => observer.on_error(Arc::clone(transport_error)).await,
                None => observer.on_warning(&err.to_string()).await,
            }
        }
    }
}

// Apply the expiry policy to a freshly fetched user-scoped list.
async fn derive_outcomes<T>(transport: &T, entities: &mut [T::Entity])
where
    T: Transport,
{
    for entity in entities.iter_mut() {
        if !transport.has_outcome(entity) && transport.has_expired(entity).await {
            transport.mark_outcome(entity);
        }
    }
}
