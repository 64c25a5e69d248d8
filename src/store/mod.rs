//! Durable store boundary
//!
//! Records, change sets, and the two collaborator traits the context layer
//! consumes: [`DurableStore`] for commits and queries, [`IdentifierService`]
//! for permanent identifier assignment.

pub mod persistence;
pub mod query;

pub use persistence::SledStore;
pub use query::{FetchRequest, Predicate, SortDescriptor};

use crate::error::StoreError;
use crate::types::{Attributes, PermanentId, RecordId};
use serde::{Deserialize, Serialize};

/// A record: identifier, entity name, and attribute values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub entity: String,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(id: RecordId, entity: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id,
            entity: entity.into(),
            attributes,
        }
    }

    /// Overlay changed attributes onto this record
    pub fn apply(&mut self, changes: &Attributes) {
        for (key, value) in changes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }
}

/// Attribute changes for an existing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub id: RecordId,
    pub entity: String,
    pub changes: Attributes,
}

/// The mutations produced by one commit at one context level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub inserted: Vec<Record>,
    pub updated: Vec<RecordPatch>,
    pub deleted: Vec<RecordId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Every identifier touched by this change set, in insert/update/delete order
    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.inserted
            .iter()
            .map(|r| r.id)
            .chain(self.updated.iter().map(|p| p.id))
            .chain(self.deleted.iter().copied())
    }

    /// Identifiers in this change set that are still temporary
    pub fn temporary_ids(&self) -> Vec<RecordId> {
        self.ids().filter(|id| id.is_temporary()).collect()
    }
}

/// Durable storage consumed by the root context and the fetch context
pub trait DurableStore: Send + Sync {
    /// Apply a change set atomically. Every identifier must be permanent.
    fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError>;

    /// Execute a query, returning matching identifiers in store order
    fn query(&self, request: &FetchRequest) -> Result<Vec<PermanentId>, StoreError>;

    /// Load one record by identifier
    fn load(&self, id: PermanentId) -> Result<Option<Record>, StoreError>;
}

/// Source of permanent identifiers
pub trait IdentifierService: Send + Sync {
    fn assign_permanent_ids(&self, entity: &str, count: usize)
        -> Result<Vec<PermanentId>, StoreError>;
}
