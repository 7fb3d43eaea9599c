use entity_sync::test::cache_for;
use entity_sync::test::init_tracing;
use entity_sync::test::observed_cache_for;
use entity_sync::test::Call;
use entity_sync::test::Item;
use entity_sync::test::MockTransport;
use entity_sync::test::RecordingObserver;
use entity_sync::SyncError;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

fn transport_with(items: &[(u64, u64, &str)]) -> Arc<MockTransport> {
    let transport = Arc::new(MockTransport::default());
    for (id, owner, body) in items {
        transport.insert(Item::new(*id, *owner, body));
    }
    transport
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_share_one_request() {
    init_tracing();
    let transport = transport_with(&[(1, 5, "hello")]);
    let cache = cache_for(transport.clone());

    let results = join_all((0..8).map(|_| cache.get(&1, false))).await;

    assert_eq!(transport.calls(), vec![Call::Fetch(1)]);
    for result in results {
        assert_eq!(result.expect("entity").body, "hello");
    }
    assert_eq!(cache.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn forced_gets_join_a_pending_request() {
    let transport = transport_with(&[(1, 5, "hello")]);
    let cache = cache_for(transport.clone());

    let (a, b, c) = tokio::join!(cache.get(&1, true), cache.get(&1, true), cache.get(&1, false));

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_ttl() {
    let transport = transport_with(&[(1, 5, "v1")]);
    let cache = cache_for(transport.clone());

    assert_eq!(cache.get(&1, false).await.unwrap().body, "v1");
    transport.insert(Item::new(1, 5, "v2"));

    tokio::time::advance(Duration::from_secs(599)).await;
    assert_eq!(cache.get(&1, false).await.unwrap().body, "v1");
    assert_eq!(transport.call_count(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cache.get(&1, false).await.unwrap().body, "v2");
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn entry_exactly_ttl_old_is_fresh() {
    let transport = transport_with(&[(1, 5, "v1")]);
    let cache = cache_for(transport.clone());

    cache.get(&1, false).await.unwrap();
    tokio::time::advance(Duration::from_secs(600)).await;
    cache.get(&1, false).await.unwrap();

    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn force_refresh_skips_fresh_entry() {
    let transport = transport_with(&[(1, 5, "v1")]);
    let cache = cache_for(transport.clone());

    cache.get(&1, false).await.unwrap();
    transport.insert(Item::new(1, 5, "v2"));

    assert_eq!(cache.get(&1, true).await.unwrap().body, "v2");
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn batch_populates_every_entry() {
    let transport = transport_with(&[(1, 5, "a"), (2, 5, "b"), (3, 6, "c")]);
    let cache = cache_for(transport.clone());

    cache.get_multiple(&[3, 1, 2, 1], false).await.unwrap();
    assert_eq!(transport.calls(), vec![Call::Batch(vec![1, 2, 3])]);

    for (id, body) in [(1, "a"), (2, "b"), (3, "c")] {
        assert_eq!(cache.get(&id, false).await.unwrap().body, body);
    }
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn batch_skips_fresh_entries() {
    let transport = transport_with(&[(1, 5, "a"), (2, 5, "b")]);
    let cache = cache_for(transport.clone());

    cache.get(&1, false).await.unwrap();
    cache.get_multiple(&[1, 2], false).await.unwrap();
    assert_eq!(transport.calls(), vec![Call::Fetch(1), Call::Batch(vec![2])]);

    // Nothing stale, nothing to ask for.
    cache.get_multiple(&[1, 2], false).await.unwrap();
    assert_eq!(transport.call_count(), 2);

    cache.get_multiple(&[1, 2], true).await.unwrap();
    assert_eq!(transport.calls()[2], Call::Batch(vec![1, 2]));
}

#[tokio::test(start_paused = true)]
async fn overlapping_batches_never_request_an_id_twice() {
    let transport = transport_with(&[(1, 5, "a"), (2, 5, "b"), (3, 5, "c")]);
    let cache = cache_for(transport.clone());

    let (a, b) = tokio::join!(cache.get_multiple(&[1, 2], false), cache.get_multiple(&[2, 3], false));
    assert!(a.is_ok() && b.is_ok());

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&Call::Batch(vec![1, 2])));
    assert!(calls.contains(&Call::Batch(vec![3])));
    assert_eq!(cache.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn single_get_joins_a_pending_batch() {
    let transport = transport_with(&[(1, 5, "a"), (2, 5, "b")]);
    let cache = cache_for(transport.clone());

    let (batch, single) = tokio::join!(cache.get_multiple(&[1, 2], false), cache.get(&2, false));

    batch.unwrap();
    assert_eq!(single.unwrap().body, "b");
    assert_eq!(transport.calls(), vec![Call::Batch(vec![1, 2])]);
}

#[tokio::test(start_paused = true)]
async fn ids_missing_from_batch_are_skipped() {
    let transport = transport_with(&[(1, 5, "a")]);
    let cache = cache_for(transport.clone());

    let (batch, single) = tokio::join!(cache.get_multiple(&[1, 99], false), cache.get(&99, false));

    batch.unwrap();
    assert!(matches!(single, Err(SyncError::NotFound(_))));
    assert_eq!(transport.calls(), vec![Call::Batch(vec![1, 99]), Call::Fetch(99)]);
    assert!(cache.peek(&1).is_some());
    assert!(cache.peek(&99).is_none());
}

#[tokio::test(start_paused = true)]
async fn single_object_batch_response_is_stored() {
    let transport = transport_with(&[(4, 5, "d")]);
    transport.set_collapse_single(true);
    let cache = cache_for(transport.clone());

    cache.get_multiple(&[4], false).await.unwrap();

    assert_eq!(cache.peek(&4).map(|i| i.body), Some("d".to_string()));
}

#[tokio::test(start_paused = true)]
async fn malformed_batch_response_is_reported_not_raised() {
    let transport = transport_with(&[(1, 5, "a")]);
    transport.set_malformed(true);
    let observer = Arc::new(RecordingObserver::default());
    let cache = observed_cache_for(transport.clone(), observer.clone());

    cache.get_multiple(&[1], false).await.unwrap();

    assert!(cache.is_empty());
    assert_eq!(observer.warnings.lock().len(), 1);

    // The id is not stuck in flight.
    transport.set_malformed(false);
    cache.get_multiple(&[1], false).await.unwrap();
    assert_eq!(transport.call_count(), 2);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_reaches_every_waiter_and_keeps_stale_data() {
    let transport = transport_with(&[(1, 5, "a")]);
    let cache = cache_for(transport.clone());

    cache.get(&1, false).await.unwrap();
    tokio::time::advance(Duration::from_secs(601)).await;
    transport.set_failing(true);

    let (a, b) = tokio::join!(cache.get(&1, false), cache.get(&1, false));
    assert!(matches!(a, Err(SyncError::Transport(_))));
    assert!(matches!(b, Err(SyncError::Transport(_))));
    assert_eq!(transport.call_count(), 2);
    assert_eq!(cache.peek(&1).map(|i| i.body), Some("a".to_string()));
}

#[tokio::test(start_paused = true)]
async fn batch_transport_failure_propagates() {
    let transport = transport_with(&[(1, 5, "a")]);
    transport.set_failing(true);
    let cache = cache_for(transport.clone());

    let err = cache.get_multiple(&[1], false).await.unwrap_err();

    assert!(err.transport_error().is_some());
    assert_eq!(cache.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn confirmed_deletion_evicts_everywhere() {
    let transport = transport_with(&[(7, 1, "doomed"), (8, 1, "kept")]);
    let observer = Arc::new(RecordingObserver::default());
    let cache = observed_cache_for(transport.clone(), observer.clone());

    assert_eq!(cache.get_by_owner(&1, false, false).await.unwrap().len(), 2);
    cache.get(&7, false).await.unwrap();

    transport.delete(7);
    let err = cache.get(&7, true).await.unwrap_err();

    assert!(err.is_not_found());
    assert!(cache.peek(&7).is_none());
    assert_eq!(cache.owner_list(&1).into_iter().map(|i| i.id).collect::<Vec<_>>(), vec![8]);
    assert_eq!(*observer.evicted.lock(), vec![7]);
}

#[tokio::test(start_paused = true)]
async fn explicit_eviction_forces_a_fetch_and_cleans_lists() {
    let transport = transport_with(&[(7, 1, "a"), (8, 1, "b")]);
    let cache = cache_for(transport.clone());

    cache.get_by_owner(&1, false, false).await.unwrap();
    cache.get(&7, false).await.unwrap();
    transport.clear_calls();

    assert!(cache.evict(&7));

    assert!(!cache.owner_list(&1).iter().any(|i| i.id == 7));
    cache.get(&7, false).await.unwrap();
    assert_eq!(transport.calls(), vec![Call::Fetch(7)]);
}

#[tokio::test(start_paused = true)]
async fn eviction_is_idempotent() {
    let transport = transport_with(&[(7, 1, "a"), (8, 1, "b")]);
    let cache = cache_for(transport.clone());
    cache.get_multiple(&[7, 8], false).await.unwrap();

    assert!(cache.evict(&7));
    assert!(!cache.evict(&7));
    assert!(!cache.evict(&12345));

    assert_eq!(cache.len(), 1);
    assert!(cache.peek(&8).is_some());
}

#[tokio::test(start_paused = true)]
async fn put_refreshes_entry_and_lists() {
    let transport = transport_with(&[(3, 1, "original")]);
    let cache = cache_for(transport.clone());
    cache.get_by_owner(&1, false, false).await.unwrap();

    cache.put(Item::new(3, 1, "edited"));

    assert_eq!(cache.get(&3, false).await.unwrap().body, "edited");
    assert_eq!(cache.owner_list(&1)[0].body, "edited");
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn fetched_entity_updates_lists_holding_it() {
    let transport = transport_with(&[(3, 1, "original")]);
    let cache = cache_for(transport.clone());
    cache.get_by_owner(&1, false, false).await.unwrap();

    transport.insert(Item::new(3, 1, "newer"));
    cache.get(&3, false).await.unwrap();

    assert_eq!(cache.owner_list(&1)[0].body, "newer");
}

#[tokio::test(start_paused = true)]
async fn remove_only_drops_primary_entry() {
    let transport = transport_with(&[(3, 1, "a")]);
    let cache = cache_for(transport.clone());
    cache.get_by_owner(&1, false, false).await.unwrap();
    cache.get(&3, false).await.unwrap();

    assert!(cache.remove(&3).is_some());

    assert!(cache.peek(&3).is_none());
    assert_eq!(cache.owner_list(&1).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalidate_all_discards_requests_in_flight() {
    let transport = transport_with(&[(1, 5, "a"), (2, 5, "b")]);
    let cache = cache_for(transport.clone());
    cache.get(&2, false).await.unwrap();

    let pending = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(&1, false).await }
    });
    tokio::task::yield_now().await;
    assert_eq!(cache.pending_requests(), 1);

    cache.invalidate_all();
    assert!(cache.is_empty());
    assert_eq!(cache.pending_requests(), 0);

    // The old request settles into nothing; the waiter asks again within the new session.
    assert_eq!(pending.await.unwrap().unwrap().body, "a");
    assert_eq!(transport.calls(), vec![Call::Fetch(2), Call::Fetch(1), Call::Fetch(1)]);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn deletion_seen_by_a_previous_session_is_not_reported() {
    let transport = transport_with(&[(7, 1, "a")]);
    let observer = Arc::new(RecordingObserver::default());
    let cache = observed_cache_for(transport.clone(), observer.clone());
    cache.get(&7, false).await.unwrap();
    transport.delete(7);

    let pending = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(&7, true).await }
    });
    tokio::task::yield_now().await;
    cache.invalidate_all();

    assert!(pending.await.unwrap().unwrap_err().is_not_found());
    assert!(observer.evicted.lock().is_empty());
}
