//! Fetches run on the background context and come back bound to the caller

use crate::integration::test_utils::fixture;
use nestore::ContextStack;
use nestore::queue::SerialQueue;
use nestore::store::{FetchRequest, Predicate, SortDescriptor};
use nestore::{attributes, Completion, ContextError, FetchMode, FetchResults, StoreError, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::time::timeout;

async fn seed_people(fx: &crate::integration::test_utils::Fixture) {
    let writer = fx.stack.new_private_context("seed");
    for (name, age) in [("Ada", 36i64), ("Alan", 41), ("Grace", 29)] {
        writer
            .insert("Person", attributes([("name", Value::from(name)), ("age", Value::from(age))]))
            .await
            .unwrap();
    }
    writer.insert("Pet", attributes([("name", "Rex")])).await.unwrap();
    writer.save().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_both_modes_return_same_identifiers() {
    let fx = fixture();
    seed_people(&fx).await;
    let reader = fx.stack.main().new_child("reader");
    let request = FetchRequest::new("Person");

    let ids = reader.fetch(&request, FetchMode::Identifiers).await.unwrap();
    let records = reader.fetch(&request, FetchMode::Records).await.unwrap();

    assert!(matches!(ids, FetchResults::Identifiers(_)));
    assert_eq!(ids.len(), 3);
    assert_eq!(ids.ids(), records.ids());

    // Identifiers resolve through the caller into the records the other mode returned
    for (id, record) in ids.ids().into_iter().zip(records.into_records().unwrap()) {
        let resolved = reader.record_with_id(id).await.unwrap();
        assert_eq!(resolved, record);
        assert_eq!(resolved.load().await.unwrap(), record.load().await.unwrap());
    }
    assert_eq!(fx.stack.fetch_context().stats().await.unwrap().queries_executed, 2);
    // The caller's queue never ran the query
    assert_eq!(reader.stats().await.unwrap().queries_executed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_records_are_bound_to_caller() {
    let fx = fixture();
    seed_people(&fx).await;
    let reader = fx.stack.main().new_child("reader");

    let request = FetchRequest::new("Person").with_predicate(Predicate::equals("name", "Ada"));
    let records = reader.fetch_records(&request).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].context_id(), reader.id());
    assert_eq!(records[0].context(), Some(reader.clone()));

    let loaded = records[0].load().await.unwrap().unwrap();
    assert_eq!(loaded.attributes["age"], Value::Int(36));

    // A sibling cannot use the handle
    let sibling = fx.stack.main().new_child("sibling");
    assert!(sibling.materialize(&records[0]).await.unwrap_err().is_validation());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_result_is_success() {
    let fx = fixture();
    let results = fx
        .stack
        .main()
        .fetch(&FetchRequest::new("Nothing"), FetchMode::Records)
        .await
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(results.into_records(), Some(Vec::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_failure_is_reported() {
    let fx = fixture();
    fx.store.fail_queries.store(true, Ordering::SeqCst);

    let error = fx
        .stack
        .main()
        .fetch_ids(&FetchRequest::new("Person"))
        .await
        .unwrap_err();
    assert_eq!(
        error,
        ContextError::QueryExecutionFailure(StoreError::Io("index unavailable".to_string()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sort_and_limit_are_applied() {
    let fx = fixture();
    seed_people(&fx).await;
    let reader = fx.stack.main().new_child("reader");

    let request = FetchRequest::new("Person")
        .sorted_by(SortDescriptor::descending("age"))
        .with_limit(2);
    let mut names = Vec::new();
    for record in reader.fetch_records(&request).await.unwrap() {
        let loaded = record.load().await.unwrap().unwrap();
        names.push(loaded.attributes["name"].clone());
    }
    assert_eq!(names, vec![Value::from("Alan"), Value::from("Ada")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_async_delivers_on_requested_queue() {
    let fx = fixture();
    seed_people(&fx).await;

    let custom = SerialQueue::spawn("custom", (), &Handle::current());
    let target = custom.clone();
    let (tx, rx) = tokio::sync::oneshot::channel();
    fx.stack.main().fetch_async(
        &FetchRequest::new("Pet"),
        FetchMode::Identifiers,
        Completion::new(move |result: Result<FetchResults, ContextError>| {
            let _ = tx.send((result, target.is_current()));
        })
        .on_queue(Arc::new(custom)),
    );

    let (result, on_custom) = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert!(on_custom);
    assert_eq!(result.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sibling_fetch_not_blocked_by_busy_sibling() {
    let fx = fixture();
    seed_people(&fx).await;
    let busy = fx.stack.main().new_child("busy");
    let free = fx.stack.main().new_child("free");

    // Park the busy sibling's queue until released
    let (release, parked) = std::sync::mpsc::channel::<()>();
    busy.dispatch_queue().dispatch(Box::new(move || {
        let _ = parked.recv();
    }));

    let results = timeout(
        Duration::from_secs(5),
        free.fetch(&FetchRequest::new("Person"), FetchMode::Records),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(results.len(), 3);

    release.send(()).unwrap();
    assert!(!busy.has_changes().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_query_does_not_hold_up_sibling_fetch() {
    let fx = fixture();
    seed_people(&fx).await;
    *fx.store.slow_entity.lock() = Some(("Slow".to_string(), Duration::from_secs(2)));
    let slow = fx.stack.main().new_child("slow");
    let fast = fx.stack.main().new_child("fast");

    let slow_request = FetchRequest::new("Slow");
    let slow_fetch = slow.fetch(&slow_request, FetchMode::Identifiers);
    let fast_fetch = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let results = fast.fetch(&FetchRequest::new("Person"), FetchMode::Records).await;
        (results, started.elapsed())
    };
    let (slow_results, (fast_results, waited)) = tokio::join!(slow_fetch, fast_fetch);

    assert_eq!(fast_results.unwrap().len(), 3);
    assert!(waited < Duration::from_secs(1), "fast fetch waited {:?}", waited);
    assert!(slow_results.unwrap().is_empty());
    assert_eq!(fx.stack.fetch_context().stats().await.unwrap().queries_executed, 2);
}

#[tokio::test]
async fn test_record_load_yields_while_store_reads() {
    let fx = fixture();
    let writer = fx.stack.new_private_context("writer");
    let record = writer
        .insert("Person", attributes([("name", "Ada")]))
        .await
        .unwrap();
    writer.save().await.unwrap();

    // A second stack over the same store has nothing cached
    let fresh = ContextStack::new(
        Arc::clone(&fx.store),
        Default::default(),
        &Handle::current(),
    );
    let reader = fresh.main().new_child("reader");
    let handle = reader.record_with_id(record.id()).await.unwrap();
    *fx.store.load_delay.lock() = Some(Duration::from_millis(300));

    // The watcher only gets to run if the load gives the thread back
    let watcher = async {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if fx.store.loads_running.load(Ordering::SeqCst) > 0 {
                return true;
            }
        }
        false
    };
    let (loaded, seen_running) =
        timeout(Duration::from_secs(5), async { tokio::join!(handle.load(), watcher) })
            .await
            .unwrap();

    assert!(seen_running);
    let loaded = loaded.unwrap().unwrap();
    assert_eq!(loaded.attributes["name"], Value::from("Ada"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_and_wait_from_plain_thread() {
    let fx = fixture();
    seed_people(&fx).await;
    let reader = fx.stack.main().new_child("reader");

    let results = tokio::task::spawn_blocking(move || {
        reader.fetch_and_wait(&FetchRequest::new("Person"), FetchMode::Identifiers)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(results.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_after_stack_dropped() {
    let fx = fixture();
    let survivor = fx.stack.new_private_context("survivor");
    drop(fx);

    let error = survivor
        .fetch(&FetchRequest::new("Person"), FetchMode::Records)
        .await
        .unwrap_err();
    assert_eq!(error, ContextError::NoFetchContext);
}
