use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use cachefront::{
    CacheError, CacheKey, CacheMode, Config, HttpCache, LoadState, MaybeBackend, Mode, OpStatus,
    RequestInfo,
};
use cachefront_test::{self as test, settle, MockBackend, MockBackendFactory, TestTransaction};

fn handle() -> tokio::runtime::Handle {
    tokio::runtime::Handle::current()
}

fn new_cache(backend: &MockBackend) -> HttpCache {
    HttpCache::new(MockBackendFactory::new(backend.clone()), Config::default(), handle())
}

#[tokio::test]
async fn open_entry_completes_through_the_backend() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let mut trans = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    backend.defer();

    let status = cache.open_entry(&CacheKey::from("k"), &trans.transaction);
    assert!(status.is_pending());
    assert_eq!(backend.pending_calls(), 1);

    assert!(backend.release_next());
    let entry = trans.completion().await.unwrap().unwrap();

    assert_eq!(
        cache.add_transaction(entry, &trans.transaction),
        OpStatus::Done(Ok(()))
    );
    assert_eq!(cache.entry_snapshot(entry), Some((true, 0, 0, false)));

    cache.done_writing_to_entry(entry, true);
    settle().await;
    assert_eq!(backend.entry("k").unwrap().close_count(), 1);
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn immediate_backends_complete_synchronously() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let mut trans = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");

    // The outcome travels through the return value, not the delegate.
    let entry = match cache.open_entry(&CacheKey::from("k"), &trans.transaction) {
        OpStatus::Done(Ok(entry)) => entry,
        other => panic!("expected a synchronous open, got {other:?}"),
    };
    settle().await;
    assert_eq!(trans.try_completion(), None);

    assert_eq!(
        cache.open_entry(&CacheKey::from("missing"), &trans.transaction),
        OpStatus::Done(Err(CacheError::NotFound))
    );

    assert_eq!(
        cache.add_transaction(entry, &trans.transaction),
        OpStatus::Done(Ok(()))
    );
    cache.done_writing_to_entry(entry, true);
    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn writer_blocks_reader_until_release() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let writer = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let entry = cache
        .open_entry(&CacheKey::from("k"), &writer.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &writer.transaction),
        OpStatus::Done(Ok(()))
    );

    let mut reader = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.add_transaction(entry, &reader.transaction).is_pending());

    settle().await;
    assert_eq!(reader.try_completion(), None);

    cache.done_writing_to_entry(entry, true);
    assert_eq!(reader.completion().await, Ok(Some(entry)));
    assert_eq!(cache.entry_snapshot(entry), Some((false, 1, 0, false)));

    cache.done_with_entry(entry, &reader.transaction, false);
    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
    assert_eq!(backend.entry("k").unwrap().close_count(), 1);
}

#[tokio::test]
async fn concurrent_opens_share_one_backend_call() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let mut t1 = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let mut t2 = TestTransaction::with_key(&cache, Mode::Read, "k");
    backend.defer();

    assert!(cache.open_entry(&CacheKey::from("k"), &t1.transaction).is_pending());
    assert!(cache.open_entry(&CacheKey::from("k"), &t2.transaction).is_pending());
    assert_eq!(backend.pending_calls(), 1);

    assert!(backend.release_next());
    let entry = t1.completion().await.unwrap().unwrap();
    assert_eq!(t2.completion().await, Ok(Some(entry)));
}

#[tokio::test]
async fn second_create_loses_the_race() {
    test::setup();
    let backend = MockBackend::new();
    let cache = new_cache(&backend);

    let mut t1 = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let mut t2 = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    backend.defer();

    assert!(cache.create_entry(&CacheKey::from("k"), &t1.transaction).is_pending());
    assert!(cache.create_entry(&CacheKey::from("k"), &t2.transaction).is_pending());
    assert_eq!(backend.pending_calls(), 1);

    assert!(backend.release_next());
    let entry = t1.completion().await.unwrap().unwrap();
    assert_eq!(t2.completion().await, Err(CacheError::CreateFailure));

    assert_eq!(
        cache.add_transaction(entry, &t1.transaction),
        OpStatus::Done(Ok(()))
    );
    cache.done_writing_to_entry(entry, true);
    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn dooming_an_entry_detaches_it_and_races_the_queue() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);
    let disk_entry = backend.entry("k").unwrap();

    let writer = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let entry = cache
        .open_entry(&CacheKey::from("k"), &writer.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &writer.transaction),
        OpStatus::Done(Ok(()))
    );

    let mut t2 = TestTransaction::with_key(&cache, Mode::Read, "k");
    let mut t3 = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.add_transaction(entry, &t2.transaction).is_pending());
    assert!(cache.add_transaction(entry, &t3.transaction).is_pending());

    let doomer = TestTransaction::with_key(&cache, Mode::None, "k");
    assert_eq!(
        cache.doom_entry(&CacheKey::from("k"), &doomer.transaction),
        OpStatus::Done(Ok(()))
    );
    assert!(disk_entry.is_doomed());
    assert_eq!(cache.entry_snapshot(entry), Some((true, 0, 2, true)));
    assert_eq!(cache.table_sizes(), (0, 1, 0));

    // The writer abandons the write midway and the truncation is not
    // recorded, so the entry cannot be kept; everyone queued restarts.
    writer.delegate.set_truncate_result(false);
    cache.done_with_entry(entry, &writer.transaction, true);
    assert_eq!(writer.delegate.truncate_calls(), 1);

    assert_eq!(t2.completion().await, Err(CacheError::Race));
    assert_eq!(t3.completion().await, Err(CacheError::Race));

    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
    assert_eq!(disk_entry.close_count(), 1);
}

#[tokio::test]
async fn dooming_without_an_active_entry_goes_through_the_backend() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let trans = TestTransaction::with_key(&cache, Mode::None, "k");
    assert_eq!(
        cache.doom_entry(&CacheKey::from("k"), &trans.transaction),
        OpStatus::Done(Ok(()))
    );
    assert!(backend.entry("k").unwrap().is_doomed());
}

#[tokio::test]
async fn a_doom_in_flight_races_everything_queued_behind_it() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);
    backend.defer();

    let mut doomer = TestTransaction::with_key(&cache, Mode::None, "k");
    assert!(cache.doom_entry(&CacheKey::from("k"), &doomer.transaction).is_pending());

    let mut opener = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    assert!(cache.open_entry(&CacheKey::from("k"), &opener.transaction).is_pending());
    assert_eq!(backend.pending_calls(), 1);

    assert!(backend.release_next());
    assert_eq!(doomer.completion().await, Ok(None));
    assert_eq!(opener.completion().await, Err(CacheError::Race));
    assert!(backend.entry("k").unwrap().is_doomed());
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn transactions_queue_on_backend_creation_in_arrival_order() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("a");
    backend.populate("b");
    let factory = MockBackendFactory::deferred(backend.clone());
    let cache = HttpCache::new(factory.clone(), Config::default(), handle());

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut t1 = TestTransaction::with_key(&cache, Mode::ReadWrite, "a");
    let mut t2 = TestTransaction::with_key(&cache, Mode::ReadWrite, "b");
    {
        let order = Arc::clone(&order);
        t1.delegate.set_hook(move |_| order.lock().push("t1"));
    }
    {
        let order = Arc::clone(&order);
        t2.delegate.set_hook(move |_| order.lock().push("t2"));
    }

    assert!(cache.open_entry(&CacheKey::from("a"), &t1.transaction).is_pending());
    assert!(cache.open_entry(&CacheKey::from("b"), &t2.transaction).is_pending());
    assert_eq!(factory.pending_creates(), 1);

    assert!(factory.release_next());
    assert_eq!(t1.completion().await, Ok(None));
    assert_eq!(t2.completion().await, Ok(None));
    assert_eq!(*order.lock(), ["t1", "t2"]);

    // With the backend live, the retried opens go through directly.
    let entry = cache
        .open_entry(&CacheKey::from("a"), &t1.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &t1.transaction),
        OpStatus::Done(Ok(()))
    );
    cache.done_writing_to_entry(entry, true);
    settle().await;
}

#[tokio::test]
async fn get_backend_waits_for_construction() {
    test::setup();
    let backend = MockBackend::new();
    let factory = MockBackendFactory::deferred(backend.clone());
    let cache = HttpCache::new(factory.clone(), Config::default(), handle());

    let rx = match cache.get_backend() {
        Ok(MaybeBackend::Pending(rx)) => rx,
        _ => panic!("expected backend construction to be pending"),
    };
    assert!(cache.current_backend().is_none());

    assert!(factory.release_next());
    assert!(rx.await.unwrap().is_ok());
    assert!(cache.current_backend().is_some());
    assert!(matches!(cache.get_backend(), Ok(MaybeBackend::Ready(_))));
}

#[tokio::test]
async fn failed_backend_construction_fails_waiters_and_later_requests() {
    test::setup();
    let backend = MockBackend::new();
    let factory = MockBackendFactory::deferred(backend.clone());
    factory.set_fail(true);
    let cache = HttpCache::new(factory.clone(), Config::default(), handle());

    let mut trans = TestTransaction::with_key(&cache, Mode::ReadWrite, "a");
    assert!(cache.open_entry(&CacheKey::from("a"), &trans.transaction).is_pending());

    assert!(factory.release_next());
    assert_eq!(trans.completion().await, Err(CacheError::Failed));

    assert!(matches!(cache.get_backend(), Err(CacheError::Failed)));
    assert_eq!(
        cache.open_entry(&CacheKey::from("a"), &trans.transaction),
        OpStatus::Done(Err(CacheError::Failed))
    );
}

#[tokio::test]
async fn cancelling_from_a_completion_skips_the_cancelled_transaction() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let writer = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let entry = cache
        .open_entry(&CacheKey::from("k"), &writer.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &writer.transaction),
        OpStatus::Done(Ok(()))
    );

    let mut t1 = TestTransaction::with_key(&cache, Mode::Read, "k");
    let mut t2 = TestTransaction::with_key(&cache, Mode::Read, "k");
    let mut t3 = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.add_transaction(entry, &t1.transaction).is_pending());
    assert!(cache.add_transaction(entry, &t2.transaction).is_pending());
    assert!(cache.add_transaction(entry, &t3.transaction).is_pending());

    // The first admitted reader cancels the one behind it, from inside its
    // own completion.
    {
        let cache = cache.clone();
        let target = t2.transaction.clone();
        t1.delegate
            .set_hook(move |_| cache.remove_pending_transaction(&target));
    }

    cache.done_writing_to_entry(entry, true);
    assert_eq!(t1.completion().await, Ok(Some(entry)));
    assert_eq!(t3.completion().await, Ok(Some(entry)));
    settle().await;
    assert_eq!(t2.try_completion(), None);
    assert_eq!(cache.entry_snapshot(entry), Some((false, 2, 0, false)));

    cache.done_with_entry(entry, &t1.transaction, false);
    cache.done_with_entry(entry, &t3.transaction, false);
    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn converting_the_writer_admits_queued_readers() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let writer = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let entry = cache
        .open_entry(&CacheKey::from("k"), &writer.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &writer.transaction),
        OpStatus::Done(Ok(()))
    );

    let mut reader = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.add_transaction(entry, &reader.transaction).is_pending());

    cache.convert_writer_to_reader(entry);
    assert_eq!(reader.completion().await, Ok(Some(entry)));
    assert_eq!(cache.entry_snapshot(entry), Some((false, 2, 0, false)));

    cache.done_with_entry(entry, &writer.transaction, false);
    cache.done_with_entry(entry, &reader.transaction, false);
    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
    assert_eq!(backend.entry("k").unwrap().close_count(), 1);
}

#[tokio::test]
async fn queued_writer_waits_for_readers_and_keeps_its_turn() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let writer = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let entry = cache
        .open_entry(&CacheKey::from("k"), &writer.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &writer.transaction),
        OpStatus::Done(Ok(()))
    );

    let mut reader = TestTransaction::with_key(&cache, Mode::Read, "k");
    let mut second_writer = TestTransaction::with_key(&cache, Mode::Write, "k");
    let mut late_reader = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.add_transaction(entry, &reader.transaction).is_pending());
    assert!(cache.add_transaction(entry, &second_writer.transaction).is_pending());
    assert!(cache.add_transaction(entry, &late_reader.transaction).is_pending());

    cache.done_writing_to_entry(entry, true);
    assert_eq!(reader.completion().await, Ok(Some(entry)));

    // The queued writer has to wait for the reader to drain, and the reader
    // queued behind the writer cannot overtake it.
    settle().await;
    assert_eq!(second_writer.try_completion(), None);
    assert_eq!(late_reader.try_completion(), None);
    assert_eq!(cache.entry_snapshot(entry), Some((false, 1, 2, false)));

    cache.done_with_entry(entry, &reader.transaction, false);
    assert_eq!(second_writer.completion().await, Ok(Some(entry)));
    assert_eq!(cache.entry_snapshot(entry), Some((true, 0, 1, false)));

    cache.done_writing_to_entry(entry, true);
    assert_eq!(late_reader.completion().await, Ok(Some(entry)));

    cache.done_with_entry(entry, &late_reader.transaction, false);
    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn a_failed_write_dooms_the_entry_and_restarts_the_queue() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);
    let disk_entry = backend.entry("k").unwrap();

    let writer = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let entry = cache
        .open_entry(&CacheKey::from("k"), &writer.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &writer.transaction),
        OpStatus::Done(Ok(()))
    );

    let mut queued = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.add_transaction(entry, &queued.transaction).is_pending());

    cache.done_writing_to_entry(entry, false);
    assert_eq!(queued.completion().await, Err(CacheError::Race));
    assert!(disk_entry.is_doomed());
    assert_eq!(disk_entry.close_count(), 1);
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn cancelling_the_lead_create_discards_the_produced_entry() {
    test::setup();
    let backend = MockBackend::new();
    let cache = new_cache(&backend);
    backend.defer();

    let mut creator = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    assert!(cache.create_entry(&CacheKey::from("k"), &creator.transaction).is_pending());

    let mut opener = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    assert!(cache.open_entry(&CacheKey::from("k"), &opener.transaction).is_pending());

    cache.remove_pending_transaction(&creator.transaction);

    assert!(backend.release_next());
    assert_eq!(opener.completion().await, Err(CacheError::Race));

    settle().await;
    assert_eq!(creator.try_completion(), None);

    let disk_entry = backend.entry("k").unwrap();
    assert!(disk_entry.is_doomed());
    assert_eq!(disk_entry.close_count(), 1);
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn cancelling_a_queued_transaction_silences_it() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);
    backend.defer();

    let mut t1 = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let mut t2 = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.open_entry(&CacheKey::from("k"), &t1.transaction).is_pending());
    assert!(cache.open_entry(&CacheKey::from("k"), &t2.transaction).is_pending());

    cache.remove_pending_transaction(&t2.transaction);

    assert!(backend.release_next());
    let entry = t1.completion().await.unwrap().unwrap();
    settle().await;
    assert_eq!(t2.try_completion(), None);

    assert_eq!(
        cache.add_transaction(entry, &t1.transaction),
        OpStatus::Done(Ok(()))
    );
    cache.done_writing_to_entry(entry, true);
    settle().await;
    assert_eq!(cache.table_sizes(), (0, 0, 0));
}

#[tokio::test]
async fn teardown_discards_inflight_backend_construction() {
    test::setup();
    let backend = MockBackend::new();
    let factory = MockBackendFactory::deferred(backend.clone());
    let cache = HttpCache::new(factory.clone(), Config::default(), handle());

    let rx = match cache.get_backend() {
        Ok(MaybeBackend::Pending(rx)) => rx,
        _ => panic!("expected backend construction to be pending"),
    };

    drop(cache);
    assert!(factory.release_next());
    settle().await;
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn teardown_closes_entries_produced_after_the_fact() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let trans = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    backend.defer();
    assert!(cache.open_entry(&CacheKey::from("k"), &trans.transaction).is_pending());

    drop(cache);
    assert!(backend.release_next());
    settle().await;
    assert_eq!(backend.entry("k").unwrap().close_count(), 1);
}

#[tokio::test]
async fn teardown_closes_active_entries() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let trans = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    let entry = cache
        .open_entry(&CacheKey::from("k"), &trans.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &trans.transaction),
        OpStatus::Done(Ok(()))
    );

    drop(cache);
    assert_eq!(backend.entry("k").unwrap().close_count(), 1);
}

#[tokio::test]
async fn load_state_reports_the_writers_state() {
    test::setup();
    let backend = MockBackend::new();
    backend.populate("k");
    let cache = new_cache(&backend);

    let writer = TestTransaction::with_key(&cache, Mode::ReadWrite, "k");
    writer.delegate.set_load_state(LoadState::ReadingResponse);
    let entry = cache
        .open_entry(&CacheKey::from("k"), &writer.transaction)
        .done()
        .unwrap()
        .unwrap();
    assert_eq!(
        cache.add_transaction(entry, &writer.transaction),
        OpStatus::Done(Ok(()))
    );

    let queued = TestTransaction::with_key(&cache, Mode::Read, "k");
    assert!(cache.add_transaction(entry, &queued.transaction).is_pending());
    assert_eq!(
        cache.get_load_state_for_pending(&queued.transaction),
        LoadState::ReadingResponse
    );

    let elsewhere = TestTransaction::with_key(&cache, Mode::Read, "other");
    assert_eq!(
        cache.get_load_state_for_pending(&elsewhere.transaction),
        LoadState::WaitingForCache
    );

    cache.done_writing_to_entry(entry, true);
    settle().await;
}

#[tokio::test]
async fn record_mode_generates_generation_counted_keys() {
    test::setup();
    let backend = MockBackend::new();
    let cache = HttpCache::new(
        MockBackendFactory::new(backend.clone()),
        Config {
            mode: CacheMode::Record,
        },
        handle(),
    );

    let request = RequestInfo::new(Url::parse("http://example.com/").unwrap(), "GET");
    assert_eq!(
        cache.generate_cache_key(&request).unwrap().as_str(),
        "0GEThttp://example.com/"
    );
    assert_eq!(
        cache.generate_cache_key(&request).unwrap().as_str(),
        "1GEThttp://example.com/"
    );
}

#[tokio::test]
async fn disabled_caches_refuse_key_computation() {
    test::setup();
    let backend = MockBackend::new();
    let cache = HttpCache::new(
        MockBackendFactory::new(backend.clone()),
        Config {
            mode: CacheMode::Disable,
        },
        handle(),
    );

    let request = RequestInfo::new(Url::parse("http://example.com/").unwrap(), "GET");
    assert_eq!(cache.generate_cache_key(&request), Err(CacheError::Failed));
}
