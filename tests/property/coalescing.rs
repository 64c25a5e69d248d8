//! Property-based tests for pending change coalescing

use nestore::context::{Mutation, PendingChanges};
use nestore::store::{Record, RecordPatch};
use nestore::{attributes, PermanentId, RecordId};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, i64),
    Update(u64, i64),
    Delete(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..6, any::<i64>()).prop_map(|(id, n)| Op::Insert(id, n)),
        (1u64..6, any::<i64>()).prop_map(|(id, n)| Op::Update(id, n)),
        (1u64..6).prop_map(Op::Delete),
    ]
}

fn id(raw: u64) -> RecordId {
    RecordId::from(PermanentId::new(raw))
}

fn mutation(op: &Op) -> Mutation {
    match *op {
        Op::Insert(raw, n) => Mutation::Insert(Record::new(id(raw), "Counter", attributes([("n", n)]))),
        Op::Update(raw, n) => Mutation::Update(RecordPatch {
            id: id(raw),
            entity: "Counter".to_string(),
            changes: attributes([("n", n)]),
        }),
        Op::Delete(raw) => Mutation::Delete(id(raw)),
    }
}

/// Apply every op, ignoring rejected updates of deleted records
fn replay(pending: &mut PendingChanges, ops: &[Op]) {
    for op in ops {
        let _ = pending.apply(mutation(op));
    }
}

/// A snapshot never carries two entries for one record
#[test]
fn test_snapshot_has_one_entry_per_record() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(op_strategy(), 0..40), |ops| {
            let mut pending = PendingChanges::new();
            replay(&mut pending, &ops);

            let (changes, _) = pending.snapshot();
            let ids: Vec<RecordId> = changes.ids().collect();
            let unique: HashSet<RecordId> = ids.iter().copied().collect();
            prop_assert_eq!(ids.len(), unique.len());
            prop_assert_eq!(changes.len(), pending.len());
            prop_assert_eq!(pending.summary().total(), pending.len());
            Ok(())
        })
        .unwrap();
}

/// Clearing through a snapshot's watermark empties an otherwise untouched set
#[test]
fn test_clear_through_drops_committed_entries() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(op_strategy(), 0..40), |ops| {
            let mut pending = PendingChanges::new();
            replay(&mut pending, &ops);

            let (_, watermark) = pending.snapshot();
            pending.clear_through(watermark);
            prop_assert!(pending.is_empty());
            Ok(())
        })
        .unwrap();
}

/// Records touched after a snapshot survive the clear; nothing else does
#[test]
fn test_changes_made_during_commit_stay_pending() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                prop::collection::vec(op_strategy(), 0..30),
                prop::collection::vec(op_strategy(), 1..10),
            ),
            |(before, during)| {
                let mut pending = PendingChanges::new();
                replay(&mut pending, &before);
                let (_, watermark) = pending.snapshot();

                let mut touched = HashSet::new();
                for op in &during {
                    let target = match *op {
                        Op::Insert(raw, _) | Op::Update(raw, _) | Op::Delete(raw) => id(raw),
                    };
                    if pending.apply(mutation(op)).is_ok() {
                        touched.insert(target);
                    }
                }
                pending.clear_through(watermark);

                let (remaining, _) = pending.snapshot();
                for remaining_id in remaining.ids() {
                    prop_assert!(touched.contains(&remaining_id));
                }
                Ok(())
            },
        )
        .unwrap();
}

/// Inserting and deleting the same record before any commit leaves no trace
#[test]
fn test_insert_then_delete_vanishes() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(1u64..1000, any::<i64>()), |(raw, n)| {
            let mut pending = PendingChanges::new();
            pending.apply(mutation(&Op::Insert(raw, n))).unwrap();
            pending.apply(mutation(&Op::Update(raw, n / 2))).unwrap();
            pending.apply(mutation(&Op::Delete(raw))).unwrap();
            prop_assert!(pending.is_empty());
            Ok(())
        })
        .unwrap();
}
