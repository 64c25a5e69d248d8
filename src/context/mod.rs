//! Queue-affine persistence contexts.
//!
//! A [`Context`] is a scratchpad of record mutations bound to its own serial
//! queue. Contexts form a tree: a child commits into its parent, and the root
//! commits into the durable store. Save propagation, fetch translation, the
//! notification relay and the identity policy live in the submodules; this
//! module holds the context itself, its mutation API and fault resolution.

pub mod fetch;
pub mod identity;
pub mod record;
pub mod relay;
pub mod save;
pub mod state;

pub use fetch::{FetchMode, FetchResults};
pub use record::ManagedRecord;
pub use state::{ContextStats, Mutation, PendingChanges, PendingSummary};

use crate::config::IdentityConfig;
use crate::error::{ContextError, QueueError, StoreError, ValidationError};
use crate::events::EventBus;
use crate::queue::{DispatchQueue, SerialQueue};
use crate::store::{DurableStore, IdentifierService, Record};
use crate::types::{Attributes, ContextId, RecordId};
use parking_lot::{Mutex, RwLock};
use state::{ContextState, Lookup};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::debug;

/// Per-record validation hook run on every commit of a context
pub type Validator = Arc<dyn Fn(&Record) -> Result<(), String> + Send + Sync>;

/// Position of a context in its stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    /// Writes to the durable store
    Root,
    /// The stack's main-side context, child of the root
    Main,
    /// Executes fetch requests; never holds mutations
    Fetch,
    /// Any other context
    Private,
}

/// Collaborators shared by every context of one stack
pub(crate) struct Environment {
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) ids: Arc<dyn IdentifierService>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) main_queue: Arc<dyn DispatchQueue>,
    pub(crate) handle: Handle,
    pub(crate) identity: IdentityConfig,
    pub(crate) fetch_context: RwLock<Weak<ContextInner>>,
}

impl Environment {
    /// Run blocking store work on the runtime's blocking pool, off every queue
    pub(crate) async fn with_store<R, F>(&self, work: F) -> Result<R, StoreError>
    where
        F: FnOnce(&dyn DurableStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        self.handle
            .spawn_blocking(move || work(store.as_ref()))
            .await
            .map_err(|e| StoreError::Io(format!("store task failed: {}", e)))?
    }
}

pub(crate) struct ContextInner {
    pub(crate) id: ContextId,
    pub(crate) label: String,
    pub(crate) role: ContextRole,
    pub(crate) queue: SerialQueue<ContextState>,
    parent: Option<Weak<ContextInner>>,
    children: Mutex<Vec<Weak<ContextInner>>>,
    pub(crate) env: Arc<Environment>,
    pub(crate) obtain_permanent_ids: AtomicBool,
    pub(crate) validator: RwLock<Option<Validator>>,
    /// Held for the whole propagation of one save
    pub(crate) save_gate: Arc<tokio::sync::Mutex<()>>,
    /// Finish signal of the latest `save_async`; the next one waits on it
    pub(crate) save_tail: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    /// Buses of other stacks this context subscribed to through `observe`
    pub(crate) foreign_buses: Mutex<Vec<Weak<EventBus>>>,
}

impl ContextInner {
    pub(crate) fn spawn(
        env: Arc<Environment>,
        parent: Option<&Arc<ContextInner>>,
        label: impl Into<String>,
        role: ContextRole,
        obtain_permanent_ids: bool,
    ) -> Arc<Self> {
        let id = ContextId::next();
        let label = label.into();
        let queue = SerialQueue::spawn(
            format!("{}#{}", label, id),
            ContextState::new(id),
            &env.handle,
        );

        let inner = Arc::new(Self {
            id,
            label,
            role,
            queue,
            parent: parent.map(Arc::downgrade),
            children: Mutex::new(Vec::new()),
            env,
            obtain_permanent_ids: AtomicBool::new(obtain_permanent_ids),
            validator: RwLock::new(None),
            save_gate: Arc::new(tokio::sync::Mutex::new(())),
            save_tail: Mutex::new(None),
            foreign_buses: Mutex::new(Vec::new()),
        });

        if let Some(parent) = parent {
            let mut children = parent.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&inner));
        }

        debug!(
            context = %inner.id,
            label = %inner.label,
            role = ?role,
            parent = ?parent.map(|p| p.id),
            "Context created"
        );
        inner
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Parent context; an error if it has been released
    pub(crate) fn parent(&self) -> Result<Option<Arc<ContextInner>>, ContextError> {
        match &self.parent {
            None => Ok(None),
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or(ContextError::ContextReleased(self.id)),
        }
    }

    /// Run `f` on this context's queue
    pub(crate) async fn run<R, F>(&self, f: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut ContextState) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.queue.perform(f).await?)
    }

    /// Refuse blocking calls from a thread running this context's or an ancestor's queue
    pub(crate) fn ensure_not_on_chain(&self) -> Result<(), ContextError> {
        if self.queue.is_current() {
            return Err(QueueError::Reentrant(self.queue.label().to_string()).into());
        }
        let mut next = self.parent.as_ref().and_then(Weak::upgrade);
        while let Some(level) = next {
            if level.queue.is_current() {
                return Err(QueueError::Reentrant(level.queue.label().to_string()).into());
            }
            next = level.parent.as_ref().and_then(Weak::upgrade);
        }
        Ok(())
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.env.bus.forget_context(self.id);
        for bus in self.foreign_buses.get_mut().drain(..) {
            if let Some(bus) = bus.upgrade() {
                bus.forget_context(self.id);
            }
        }
        debug!(context = %self.id, label = %self.label, "Context released");
    }
}

/// Outcome of resolving a record through a context and its ancestors
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolved {
    Record(Record),
    Deleted,
    Missing,
}

/// Handle to a persistence context; clones share the same context
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("role", &self.inner.role)
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl Context {
    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    /// Create a child committing into this context.
    ///
    /// The child starts with `identity.obtain_permanent_ids_by_default`.
    pub fn new_child(&self, label: impl Into<String>) -> Context {
        let obtain = self.inner.env.identity.obtain_permanent_ids_by_default;
        self.child_with_policy(label, obtain)
    }

    pub(crate) fn child_with_policy(&self, label: impl Into<String>, obtain: bool) -> Context {
        Context::from_inner(ContextInner::spawn(
            Arc::clone(&self.inner.env),
            Some(&self.inner),
            label,
            ContextRole::Private,
            obtain,
        ))
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn role(&self) -> ContextRole {
        self.inner.role
    }

    /// Whether this context writes straight to the durable store
    pub fn is_root(&self) -> bool {
        self.inner.is_root()
    }

    pub fn parent(&self) -> Option<Context> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Context::from_inner)
    }

    /// Live children of this context
    pub fn children(&self) -> Vec<Context> {
        self.inner
            .children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(Context::from_inner)
            .collect()
    }

    /// This context's queue as a completion delivery target
    pub fn dispatch_queue(&self) -> Arc<dyn DispatchQueue> {
        Arc::new(self.inner.queue.clone())
    }

    /// Install a validator run against every inserted record and update patch at commit
    pub fn set_validator<F>(&self, validator: F)
    where
        F: Fn(&Record) -> Result<(), String> + Send + Sync + 'static,
    {
        *self.inner.validator.write() = Some(Arc::new(validator));
    }

    pub fn clear_validator(&self) {
        *self.inner.validator.write() = None;
    }

    /// Insert a new record; it carries a temporary identifier until one is assigned
    pub async fn insert(
        &self,
        entity: impl Into<String>,
        attributes: Attributes,
    ) -> Result<ManagedRecord, ContextError> {
        let entity = entity.into();
        if entity.is_empty() {
            return Err(ValidationError::EmptyEntity.into());
        }
        let cell = self
            .inner
            .run(move |state| -> Result<_, ValidationError> {
                let id = state.mint_temporary_id();
                state
                    .pending
                    .apply(Mutation::Insert(Record::new(id, entity, attributes)))?;
                Ok(state.register_identity(id))
            })
            .await??;
        Ok(ManagedRecord::new(cell, &self.inner))
    }

    /// Record attribute changes for `record`
    pub async fn update(
        &self,
        record: &ManagedRecord,
        changes: Attributes,
    ) -> Result<(), ContextError> {
        self.check_owner(record)?;
        let id = record.id();
        let current = self.require(id).await?;
        self.inner
            .run(move |state| {
                let id = state.canonical(id);
                state
                    .pending
                    .apply(Mutation::Update(state::patch(id, &current.entity, changes)))
            })
            .await??;
        Ok(())
    }

    /// Mark `record` deleted
    pub async fn delete(&self, record: &ManagedRecord) -> Result<(), ContextError> {
        self.check_owner(record)?;
        let id = record.id();
        self.require(id).await?;
        self.inner
            .run(move |state| {
                let id = state.canonical(id);
                state.pending.apply(Mutation::Delete(id))
            })
            .await??;
        Ok(())
    }

    pub async fn has_changes(&self) -> Result<bool, ContextError> {
        self.inner.run(|state| !state.pending.is_empty()).await
    }

    pub async fn pending_summary(&self) -> Result<PendingSummary, ContextError> {
        self.inner.run(|state| state.pending.summary()).await
    }

    pub async fn stats(&self) -> Result<ContextStats, ContextError> {
        self.inner.run(|state| state.stats()).await
    }

    /// Handle for `id` bound to this context. Temporary identifiers are only
    /// accepted from the context that minted them.
    pub async fn record_with_id(&self, id: RecordId) -> Result<ManagedRecord, ContextError> {
        let cell = self
            .inner
            .run(move |state| -> Result<_, ValidationError> {
                let id = state.check_usable(id)?;
                Ok(state.register_identity(id))
            })
            .await??;
        Ok(ManagedRecord::new(cell, &self.inner))
    }

    /// Resolve a handle's fault: pending changes first, then the registered
    /// records, then each ancestor, then the store.
    pub async fn materialize(&self, record: &ManagedRecord) -> Result<Option<Record>, ContextError> {
        self.check_owner(record)?;
        match self.resolve(record.id()).await? {
            Resolved::Record(found) => Ok(Some(found)),
            Resolved::Deleted | Resolved::Missing => Ok(None),
        }
    }

    fn check_owner(&self, record: &ManagedRecord) -> Result<(), ContextError> {
        if record.context_id() != self.inner.id {
            return Err(ValidationError::ForeignHandle {
                owner: record.context_id(),
                context: self.inner.id,
            }
            .into());
        }
        Ok(())
    }

    async fn require(&self, id: RecordId) -> Result<Record, ContextError> {
        match self.resolve(id).await? {
            Resolved::Record(found) => Ok(found),
            Resolved::Deleted => Err(ValidationError::RecordDeleted(id).into()),
            Resolved::Missing => Err(ValidationError::UnknownRecord(id).into()),
        }
    }

    pub(crate) async fn resolve(&self, id: RecordId) -> Result<Resolved, ContextError> {
        let own = self.inner.run(move |state| state.lookup(id)).await?;
        let own_patch = match own {
            Lookup::Found(found) => return Ok(Resolved::Record(found)),
            Lookup::Deleted => return Ok(Resolved::Deleted),
            Lookup::Patch(patch) => Some(patch),
            Lookup::Unknown => None,
        };

        let mut ancestor_patches = Vec::new();
        let mut next = self.inner.parent()?;
        let base = loop {
            let Some(level) = next else {
                break match id.permanent() {
                    Some(permanent) => self
                        .inner
                        .env
                        .with_store(move |store| store.load(permanent))
                        .await
                        .map_err(ContextError::QueryExecutionFailure)?,
                    None => None,
                };
            };
            match level.run(move |state| state.lookup(id)).await? {
                Lookup::Found(found) => break Some(found),
                Lookup::Deleted => return Ok(Resolved::Deleted),
                Lookup::Patch(patch) => ancestor_patches.push(patch),
                Lookup::Unknown => {}
            }
            next = level.parent()?;
        };

        let Some(mut found) = base else {
            return Ok(Resolved::Missing);
        };
        // Nearest ancestor's changes win
        for patch in ancestor_patches.iter().rev() {
            found.apply(&patch.changes);
        }

        let snapshot = found.clone();
        self.inner.queue.submit(move |state| state.register_snapshot(snapshot))?;

        if let Some(patch) = own_patch {
            found.apply(&patch.changes);
        }
        Ok(Resolved::Record(found))
    }
}
