//! Save propagation through context chains

use crate::integration::test_utils::{eager_child, fixture, record_save_events};
use nestore::events::EventKind;
use nestore::{
    attributes, Completion, ContextError, FetchRequest, QueueError, StoreError, ValidationError,
    Value,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leaf_mid_root_commits_in_order() {
    let fx = fixture();
    let root = fx.stack.root();
    let mid = eager_child(root, "mid");
    let leaf = eager_child(&mid, "leaf");
    let events = record_save_events(&fx.stack, &[&leaf, &mid, root]);

    let record = leaf
        .insert("Person", attributes([("name", "Ada")]))
        .await
        .unwrap();
    assert!(record.is_temporary());

    let (completion, outcome) = Completion::channel();
    leaf.save_async(completion);
    let result = timeout(Duration::from_secs(5), outcome).await.unwrap().unwrap();

    assert_eq!(result, Ok(()));
    assert!(!record.is_temporary());
    assert_eq!(
        *events.lock(),
        vec![
            (leaf.id(), EventKind::WillSave),
            (leaf.id(), EventKind::DidSave),
            (mid.id(), EventKind::WillSave),
            (mid.id(), EventKind::DidSave),
            (root.id(), EventKind::WillSave),
            (root.id(), EventKind::DidSave),
        ]
    );
    assert_eq!(fx.store.commit_count(), 1);
    assert_eq!(fx.store.commits()[0].inserted[0].id, record.id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_of_depth_n_commits_n_levels() {
    let fx = fixture();
    let mut chain = vec![fx.stack.main().clone()];
    for depth in 0..4 {
        let next = eager_child(chain.last().unwrap(), &format!("level-{}", depth));
        chain.push(next);
    }
    let leaf = chain.last().unwrap().clone();
    let mut observed: Vec<_> = chain.iter().rev().collect();
    observed.push(fx.stack.root());
    let events = record_save_events(&fx.stack, &observed);

    leaf.insert("Note", attributes([("body", "hi")])).await.unwrap();
    leaf.save().await.unwrap();

    let commits: Vec<_> = events
        .lock()
        .iter()
        .filter(|(_, kind)| *kind == EventKind::DidSave)
        .map(|(id, _)| *id)
        .collect();
    let expected: Vec<_> = observed.iter().map(|c| c.id()).collect();
    assert_eq!(commits, expected);
    assert_eq!(fx.store.stored(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_validation_failure_stops_propagation() {
    let fx = fixture();
    let mid = fx.stack.new_private_context("mid");
    let leaf = eager_child(&mid, "leaf");
    mid.set_validator(|record| {
        if record.attributes.contains_key("email") {
            Ok(())
        } else {
            Err("email is required".to_string())
        }
    });
    let events = record_save_events(&fx.stack, &[fx.stack.main(), fx.stack.root()]);

    let record = leaf
        .insert("Person", attributes([("name", "Ada")]))
        .await
        .unwrap();
    let error = leaf.save().await.unwrap_err();

    assert_eq!(
        error,
        ContextError::Validation(ValidationError::Rejected {
            id: record.id(),
            reason: "email is required".to_string()
        })
    );
    assert!(events.lock().is_empty());
    assert_eq!(fx.store.commit_count(), 0);

    // The leaf committed into mid; mid keeps the change pending
    assert!(!leaf.has_changes().await.unwrap());
    assert_eq!(mid.pending_summary().await.unwrap().inserted, 1);

    mid.clear_validator();
    mid.save().await.unwrap();
    assert_eq!(fx.store.stored(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_failure_keeps_changes_for_retry() {
    let fx = fixture();
    let leaf = fx.stack.new_private_context("leaf");
    leaf.insert("Person", attributes([("name", "Ada")])).await.unwrap();

    fx.store.fail_commits.store(true, Ordering::SeqCst);
    let error = leaf.save().await.unwrap_err();
    assert_eq!(
        error,
        ContextError::CommitFailure(StoreError::Rejected("disk full".to_string()))
    );
    assert_eq!(fx.stack.root().pending_summary().await.unwrap().inserted, 1);

    // Nothing is pending in the leaf any more, but the walk still reaches the root
    fx.store.fail_commits.store(false, Ordering::SeqCst);
    leaf.save().await.unwrap();
    assert_eq!(fx.store.stored(), 1);
    assert!(!fx.stack.root().has_changes().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_fires_completion_once() {
    let fx = fixture();
    let leaf = fx.stack.new_private_context("leaf");
    leaf.insert("Person", Default::default()).await.unwrap();
    fx.store.fail_commits.store(true, Ordering::SeqCst);

    let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    leaf.save_async(Completion::new(move |result: Result<(), ContextError>| {
        sink.lock().push(result);
        let _ = done_tx.send(());
    }));
    timeout(Duration::from_secs(5), done_rx).await.unwrap().unwrap();

    // Drain the main queue to be sure nothing else was delivered
    fx.stack.main_serial_queue().perform(|_| ()).await.unwrap();
    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(matches!(calls[0], Err(ContextError::CommitFailure(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_update_and_delete_reach_store() {
    let fx = fixture();
    let writer = fx.stack.new_private_context("writer");
    let record = writer
        .insert("Person", attributes([("name", "Ada"), ("city", "London")]))
        .await
        .unwrap();
    writer.save().await.unwrap();
    let id = record.id().permanent().unwrap();

    let editor = fx.stack.new_private_context("editor");
    let handle = editor.record_with_id(record.id()).await.unwrap();
    editor
        .update(&handle, attributes([("city", "Cambridge")]))
        .await
        .unwrap();
    editor.save().await.unwrap();
    assert_eq!(
        fx.store.commits()[1].updated[0].changes["city"],
        Value::from("Cambridge")
    );

    let remover = fx.stack.new_private_context("remover");
    let doomed = remover.record_with_id(record.id()).await.unwrap();
    remover.delete(&doomed).await.unwrap();
    remover.save().await.unwrap();

    let remaining = fx
        .stack
        .main()
        .fetch_ids(&FetchRequest::new("Person"))
        .await
        .unwrap();
    assert!(!remaining.contains(&id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_on_one_context_serialize() {
    let fx = fixture();
    let leaf = fx.stack.new_private_context("leaf");
    let root = fx.stack.root().clone();

    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for (source, kind, tag) in [
        (leaf.id(), EventKind::WillSave, "start"),
        (root.id(), EventKind::DidSave, "end"),
    ] {
        let sink = Arc::clone(&log);
        fx.stack.bus().listen(source, kind, move |_| sink.lock().push(tag));
    }

    let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut outcomes = Vec::new();
    for i in 0..5i64 {
        leaf.insert("Counter", attributes([("n", i)])).await.unwrap();
        let (tx, outcome) = tokio::sync::oneshot::channel();
        let order = Arc::clone(&reported);
        leaf.save_async(Completion::new(move |result: Result<(), ContextError>| {
            order.lock().push(i);
            let _ = tx.send(result);
        }));
        outcomes.push(outcome);
    }
    for outcome in outcomes {
        let result = timeout(Duration::from_secs(5), outcome).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));
    }

    assert_eq!(*reported.lock(), (0..5).collect::<Vec<i64>>());
    let log = log.lock();
    assert_eq!(log.len(), 10);
    for pair in log.chunks(2) {
        assert_eq!(pair, ["start", "end"]);
    }
    assert_eq!(fx.store.stored(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_save_and_wait_blocks_outside_queue() {
    let fx = fixture();
    let leaf = fx.stack.new_private_context("leaf");
    leaf.insert("Person", Default::default()).await.unwrap();

    let blocking = leaf.clone();
    let result = tokio::task::spawn_blocking(move || blocking.save_and_wait())
        .await
        .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(fx.store.stored(), 1);
}

#[tokio::test]
async fn test_save_and_wait_on_current_thread_main_queue_fails() {
    let fx = fixture();
    let leaf = fx.stack.new_private_context("leaf");
    leaf.insert("Person", Default::default()).await.unwrap();

    let blocking = leaf.clone();
    let result = timeout(
        Duration::from_secs(5),
        fx.stack
            .main_serial_queue()
            .perform(move |_| blocking.save_and_wait()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        result,
        Err(ContextError::Queue(QueueError::WouldStall("main".to_string())))
    );

    // Nothing was started; the changes are still pending
    assert_eq!(fx.store.stored(), 0);
    leaf.save().await.unwrap();
    assert_eq!(fx.store.stored(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_save_and_wait_on_multi_thread_main_queue() {
    let fx = fixture();
    let leaf = fx.stack.new_private_context("leaf");
    leaf.insert("Person", Default::default()).await.unwrap();

    let blocking = leaf.clone();
    let result = timeout(
        Duration::from_secs(5),
        fx.stack
            .main_serial_queue()
            .perform(move |_| blocking.save_and_wait()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(fx.store.stored(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_save_and_wait_refuses_reentrant_call() {
    let fx = fixture();
    let leaf = fx.stack.new_private_context("leaf");
    let main = fx.stack.main().clone();

    // From a job on the parent's queue the propagation could never finish
    let (tx, rx) = tokio::sync::oneshot::channel();
    let child = leaf.clone();
    main.dispatch_queue().dispatch(Box::new(move || {
        let _ = tx.send(child.save_and_wait());
    }));
    let result = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(ContextError::Queue(QueueError::Reentrant(_)))
    ));
}
