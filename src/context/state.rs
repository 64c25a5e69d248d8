//! Per-context state owned by the context's serial queue.
//!
//! [`PendingChanges`] coalesces mutations per record so a commit carries at
//! most one entry per identifier. Every entry remembers the sequence number of
//! its last modification; a commit snapshots up to a watermark and later
//! clears exactly the entries it carried, leaving anything modified meanwhile
//! pending.

use crate::context::record::IdentityCell;
use crate::error::ValidationError;
use crate::store::{ChangeSet, Record, RecordPatch};
use crate::types::{Attributes, ContextId, PermanentId, RecordId, TemporaryId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One mutation against a context
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(Record),
    Update(RecordPatch),
    Delete(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingOp {
    Insert(Record),
    Update(RecordPatch),
    Delete,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    op: PendingOp,
    /// Sequence of the first mutation that touched this record; orders the change set
    order: u64,
    /// Sequence of the latest mutation
    seq: u64,
}

/// Coalesced pending mutations of one context
#[derive(Debug, Default)]
pub struct PendingChanges {
    entries: HashMap<RecordId, PendingEntry>,
    next_seq: u64,
    /// Identifiers carried by a commit that has not completed yet
    in_flight: HashSet<RecordId>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, id: &RecordId) -> Option<&PendingOp> {
        self.entries.get(id).map(|entry| &entry.op)
    }

    /// Apply one mutation, merging it with whatever is already pending for the record
    pub fn apply(&mut self, mutation: Mutation) -> Result<(), ValidationError> {
        self.next_seq += 1;
        let seq = self.next_seq;

        match mutation {
            Mutation::Insert(record) => {
                let id = record.id;
                let order = self.entries.get(&id).map(|e| e.order).unwrap_or(seq);
                self.entries.insert(
                    id,
                    PendingEntry {
                        op: PendingOp::Insert(record),
                        order,
                        seq,
                    },
                );
            }
            Mutation::Update(patch) => {
                let id = patch.id;
                match self.entries.get_mut(&id) {
                    Some(entry) => {
                        match &mut entry.op {
                            PendingOp::Insert(record) => record.apply(&patch.changes),
                            PendingOp::Update(existing) => {
                                for (key, value) in patch.changes {
                                    existing.changes.insert(key, value);
                                }
                            }
                            PendingOp::Delete => return Err(ValidationError::RecordDeleted(id)),
                        }
                        entry.seq = seq;
                    }
                    None => {
                        self.entries.insert(
                            id,
                            PendingEntry {
                                op: PendingOp::Update(patch),
                                order: seq,
                                seq,
                            },
                        );
                    }
                }
            }
            Mutation::Delete(id) => {
                let in_flight = self.in_flight.contains(&id);
                match self.entries.get_mut(&id) {
                    // An insert nobody else has seen simply disappears
                    Some(entry) if matches!(entry.op, PendingOp::Insert(_)) && !in_flight => {
                        self.entries.remove(&id);
                    }
                    Some(entry) => {
                        entry.op = PendingOp::Delete;
                        entry.seq = seq;
                    }
                    None => {
                        self.entries.insert(
                            id,
                            PendingEntry {
                                op: PendingOp::Delete,
                                order: seq,
                                seq,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a change set committed by a child context.
    ///
    /// Either every entry is applied or, on a conflict, none is.
    pub fn absorb(&mut self, changes: &ChangeSet) -> Result<(), ValidationError> {
        if let Some(patch) = changes
            .updated
            .iter()
            .find(|patch| matches!(self.get(&patch.id), Some(PendingOp::Delete)))
        {
            return Err(ValidationError::RecordDeleted(patch.id));
        }

        for record in &changes.inserted {
            self.apply(Mutation::Insert(record.clone()))?;
        }
        for patch in &changes.updated {
            self.apply(Mutation::Update(patch.clone()))?;
        }
        for id in &changes.deleted {
            self.apply(Mutation::Delete(*id))?;
        }
        Ok(())
    }

    /// Build the change set for a commit and mark its records in flight.
    ///
    /// Returns the change set and the watermark to pass to [`Self::clear_through`].
    pub fn snapshot(&mut self) -> (ChangeSet, u64) {
        let mut ordered: Vec<(&RecordId, &PendingEntry)> = self.entries.iter().collect();
        ordered.sort_by_key(|(_, entry)| entry.order);

        let mut changes = ChangeSet::default();
        for (id, entry) in ordered {
            match &entry.op {
                PendingOp::Insert(record) => changes.inserted.push(record.clone()),
                PendingOp::Update(patch) => changes.updated.push(patch.clone()),
                PendingOp::Delete => changes.deleted.push(*id),
            }
        }

        self.in_flight = self.entries.keys().copied().collect();
        (changes, self.next_seq)
    }

    /// Drop entries committed by the snapshot taken at `watermark`.
    ///
    /// Entries modified after the snapshot stay pending.
    pub fn clear_through(&mut self, watermark: u64) {
        let in_flight = std::mem::take(&mut self.in_flight);
        self.entries
            .retain(|id, entry| !(in_flight.contains(id) && entry.seq <= watermark));
    }

    /// Forget an aborted snapshot; all entries stay pending
    pub fn release_in_flight(&mut self) {
        self.in_flight.clear();
    }

    /// Inserted records that still carry temporary identifiers, in insertion order
    pub fn temporary_inserts(&self) -> Vec<(RecordId, String)> {
        let mut found: Vec<(u64, RecordId, String)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match &entry.op {
                PendingOp::Insert(record) if id.is_temporary() => {
                    Some((entry.order, *id, record.entity.clone()))
                }
                _ => None,
            })
            .collect();
        found.sort_by_key(|(order, _, _)| *order);
        found.into_iter().map(|(_, id, entity)| (id, entity)).collect()
    }

    /// Move a pending entry to a new identifier
    pub fn rekey(&mut self, from: RecordId, to: RecordId) {
        if let Some(mut entry) = self.entries.remove(&from) {
            match &mut entry.op {
                PendingOp::Insert(record) => record.id = to,
                PendingOp::Update(patch) => patch.id = to,
                PendingOp::Delete => {}
            }
            self.entries.insert(to, entry);
        }
        if self.in_flight.remove(&from) {
            self.in_flight.insert(to);
        }
    }

    pub fn summary(&self) -> PendingSummary {
        let mut summary = PendingSummary::default();
        for entry in self.entries.values() {
            match entry.op {
                PendingOp::Insert(_) => summary.inserted += 1,
                PendingOp::Update(_) => summary.updated += 1,
                PendingOp::Delete => summary.deleted += 1,
            }
        }
        summary
    }
}

/// Counts of pending mutations by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl PendingSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Counters describing what a context has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub commits: u64,
    pub merges_applied: u64,
    pub queries_executed: u64,
    pub registered: usize,
    pub pending: PendingSummary,
}

/// What a context knows about one record, before consulting its ancestors
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lookup {
    Found(Record),
    Deleted,
    /// Only local attribute changes are known; the base record lives further up
    Patch(RecordPatch),
    Unknown,
}

/// Everything a context owns; reachable only from jobs on its queue
pub(crate) struct ContextState {
    pub(crate) id: ContextId,
    pub(crate) pending: PendingChanges,
    /// Last known committed version of registered records
    pub(crate) objects: HashMap<RecordId, Record>,
    /// Identifier cells shared with handles issued by this context
    pub(crate) identities: HashMap<RecordId, Arc<IdentityCell>>,
    /// Temporary identifiers of this context that have since become permanent
    pub(crate) aliases: HashMap<TemporaryId, PermanentId>,
    next_temporary: u64,
    pub(crate) commits: u64,
    pub(crate) merges_applied: u64,
    pub(crate) queries_executed: u64,
}

impl ContextState {
    pub(crate) fn new(id: ContextId) -> Self {
        Self {
            id,
            pending: PendingChanges::new(),
            objects: HashMap::new(),
            identities: HashMap::new(),
            aliases: HashMap::new(),
            next_temporary: 0,
            commits: 0,
            merges_applied: 0,
            queries_executed: 0,
        }
    }

    pub(crate) fn mint_temporary_id(&mut self) -> RecordId {
        self.next_temporary += 1;
        RecordId::Temporary(TemporaryId {
            context: self.id,
            seq: self.next_temporary,
        })
    }

    /// Follow an alias if `id` is one of our temporary identifiers that became permanent
    pub(crate) fn canonical(&self, id: RecordId) -> RecordId {
        match id {
            RecordId::Temporary(temp) => self
                .aliases
                .get(&temp)
                .map(|perm| RecordId::Permanent(*perm))
                .unwrap_or(id),
            RecordId::Permanent(_) => id,
        }
    }

    /// Check that `id` may be used in this context
    pub(crate) fn check_usable(&self, id: RecordId) -> Result<RecordId, ValidationError> {
        match id {
            RecordId::Temporary(temp) if temp.context != self.id => {
                Err(ValidationError::ForeignTemporaryId {
                    id,
                    context: self.id,
                })
            }
            _ => Ok(self.canonical(id)),
        }
    }

    /// Shared identifier cell for `id`, created on first use
    pub(crate) fn register_identity(&mut self, id: RecordId) -> Arc<IdentityCell> {
        Arc::clone(
            self.identities
                .entry(id)
                .or_insert_with(|| Arc::new(IdentityCell::new(id))),
        )
    }

    pub(crate) fn lookup(&self, id: RecordId) -> Lookup {
        let id = self.canonical(id);
        match self.pending.get(&id) {
            Some(PendingOp::Insert(record)) => Lookup::Found(record.clone()),
            Some(PendingOp::Delete) => Lookup::Deleted,
            Some(PendingOp::Update(patch)) => match self.objects.get(&id) {
                Some(base) => {
                    let mut record = base.clone();
                    record.apply(&patch.changes);
                    Lookup::Found(record)
                }
                None => Lookup::Patch(patch.clone()),
            },
            None => self
                .objects
                .get(&id)
                .cloned()
                .map(Lookup::Found)
                .unwrap_or(Lookup::Unknown),
        }
    }

    /// Remember a committed version of a record fetched from an ancestor or the store
    pub(crate) fn register_snapshot(&mut self, record: Record) {
        self.objects.insert(record.id, record);
    }

    /// Fold committed changes into the registered-record cache
    pub(crate) fn apply_to_objects(&mut self, changes: &ChangeSet) {
        for record in &changes.inserted {
            self.objects.insert(record.id, record.clone());
        }
        for patch in &changes.updated {
            if let Some(record) = self.objects.get_mut(&patch.id) {
                record.apply(&patch.changes);
            }
        }
        for id in &changes.deleted {
            self.objects.remove(id);
        }
    }

    /// Finish a successful commit of the snapshot taken at `watermark`
    pub(crate) fn complete_commit(&mut self, watermark: u64, changes: &ChangeSet) {
        self.pending.clear_through(watermark);
        self.apply_to_objects(changes);
        self.commits += 1;
    }

    /// Merge a change set committed by an observed context
    pub(crate) fn merge(&mut self, changes: &ChangeSet) {
        self.apply_to_objects(changes);
        self.merges_applied += 1;
    }

    pub(crate) fn stats(&self) -> ContextStats {
        ContextStats {
            commits: self.commits,
            merges_applied: self.merges_applied,
            queries_executed: self.queries_executed,
            registered: self.objects.len(),
            pending: self.pending.summary(),
        }
    }
}

/// Build an update patch
pub(crate) fn patch(id: RecordId, entity: &str, changes: Attributes) -> RecordPatch {
    RecordPatch {
        id,
        entity: entity.to_string(),
        changes,
    }
}
