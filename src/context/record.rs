//! Managed record handles

use crate::context::{Context, ContextInner};
use crate::error::ContextError;
use crate::store::Record;
use crate::types::{ContextId, RecordId};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

/// Identifier slot shared between a context and the handles it issued
#[derive(Debug)]
pub(crate) struct IdentityCell {
    id: RwLock<RecordId>,
}

impl IdentityCell {
    pub(crate) fn new(id: RecordId) -> Self {
        Self {
            id: RwLock::new(id),
        }
    }

    pub(crate) fn get(&self) -> RecordId {
        *self.id.read()
    }

    pub(crate) fn set(&self, id: RecordId) {
        *self.id.write() = id;
    }
}

/// Lazily-faulted reference to a record, bound to the context that issued it.
///
/// The handle carries no attribute data. [`ManagedRecord::load`] resolves it
/// through the owning context. When that context obtains a permanent
/// identifier for the record, [`ManagedRecord::id`] reflects it immediately.
#[derive(Clone)]
pub struct ManagedRecord {
    cell: Arc<IdentityCell>,
    context: ContextId,
    owner: Weak<ContextInner>,
}

impl ManagedRecord {
    pub(crate) fn new(cell: Arc<IdentityCell>, owner: &Arc<ContextInner>) -> Self {
        Self {
            cell,
            context: owner.id,
            owner: Arc::downgrade(owner),
        }
    }

    /// Current identifier of the record as seen by the owning context
    pub fn id(&self) -> RecordId {
        self.cell.get()
    }

    pub fn is_temporary(&self) -> bool {
        self.id().is_temporary()
    }

    /// Context this handle is bound to
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Owning context, if it is still alive
    pub fn context(&self) -> Option<Context> {
        self.owner.upgrade().map(Context::from_inner)
    }

    /// Resolve the fault. `None` if the record is deleted or does not exist.
    pub async fn load(&self) -> Result<Option<Record>, ContextError> {
        let context = self
            .context()
            .ok_or(ContextError::ContextReleased(self.context))?;
        context.materialize(self).await
    }
}

impl PartialEq for ManagedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.id() == other.id()
    }
}

impl Eq for ManagedRecord {}

impl fmt::Debug for ManagedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedRecord")
            .field("id", &self.id())
            .field("context", &self.context)
            .finish()
    }
}
