//! Merging committed changes into observing contexts

use crate::integration::test_utils::{fixture, Fixture};
use nestore::events::EventKind;
use nestore::{attributes, Context, ManagedRecord, Value};

/// Commit a record, then register it in a fresh observer context
async fn committed_and_registered(fx: &Fixture) -> (Context, ManagedRecord) {
    let writer = fx.stack.new_private_context("writer");
    let record = writer
        .insert("Person", attributes([("city", "London")]))
        .await
        .unwrap();
    writer.save().await.unwrap();

    let observer = fx.stack.main().new_child("observer");
    let handle = observer.record_with_id(record.id()).await.unwrap();
    assert_eq!(
        handle.load().await.unwrap().unwrap().attributes["city"],
        Value::from("London")
    );
    (observer, handle)
}

async fn relocate(fx: &Fixture, handle: &ManagedRecord, city: &str) {
    let editor = fx.stack.new_private_context("editor");
    let record = editor.record_with_id(handle.id()).await.unwrap();
    editor
        .update(&record, attributes([("city", city)]))
        .await
        .unwrap();
    editor.save().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observer_merges_root_commits() {
    let fx = fixture();
    let (observer, handle) = committed_and_registered(&fx).await;
    assert!(observer.observe(fx.stack.root()));
    assert!(observer.is_observing(fx.stack.root()));

    relocate(&fx, &handle, "Paris").await;

    let stats = observer.stats().await.unwrap();
    assert_eq!(stats.merges_applied, 1);
    assert_eq!(
        handle.load().await.unwrap().unwrap().attributes["city"],
        Value::from("Paris")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unobserved_context_keeps_its_snapshot() {
    let fx = fixture();
    let (observer, handle) = committed_and_registered(&fx).await;

    relocate(&fx, &handle, "Paris").await;

    assert_eq!(observer.stats().await.unwrap().merges_applied, 0);
    assert_eq!(
        handle.load().await.unwrap().unwrap().attributes["city"],
        Value::from("London")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_observe_merges_once() {
    let fx = fixture();
    let (observer, handle) = committed_and_registered(&fx).await;
    assert!(observer.observe(fx.stack.root()));
    assert!(!observer.observe(fx.stack.root()));
    assert_eq!(
        fx.stack.bus().subscriber_count(fx.stack.root().id(), EventKind::DidSave),
        1
    );

    relocate(&fx, &handle, "Rome").await;
    assert_eq!(observer.stats().await.unwrap().merges_applied, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_observing_before_commit() {
    let fx = fixture();
    let (observer, handle) = committed_and_registered(&fx).await;
    observer.observe(fx.stack.root());
    assert!(observer.stop_observing(fx.stack.root()));
    assert!(!observer.stop_observing(fx.stack.root()));

    relocate(&fx, &handle, "Oslo").await;
    assert_eq!(observer.stats().await.unwrap().merges_applied, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_released_observer_is_forgotten() {
    let fx = fixture();
    let (observer, handle) = committed_and_registered(&fx).await;
    let root = fx.stack.root();
    observer.observe(root);
    drop(observer);

    assert_eq!(fx.stack.bus().subscriber_count(root.id(), EventKind::DidSave), 0);
    relocate(&fx, &handle, "Lima").await;
    assert_eq!(fx.store.commit_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_released_observer_leaves_other_stack_bus() {
    let home = fixture();
    let other = fixture();
    let observer = home.stack.main().new_child("observer");
    let other_root = other.stack.root();

    assert!(observer.observe(other_root));
    assert_eq!(
        other.stack.bus().subscriber_count(other_root.id(), EventKind::DidSave),
        1
    );

    drop(observer);
    assert_eq!(
        other.stack.bus().subscriber_count(other_root.id(), EventKind::DidSave),
        0
    );

    // The other stack keeps committing normally
    let writer = other.stack.new_private_context("writer");
    writer.insert("Person", attributes([("city", "Kyiv")])).await.unwrap();
    writer.save().await.unwrap();
    assert_eq!(other.store.stored(), 1);
}
