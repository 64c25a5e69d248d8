//! Context stack: the root context tied to the durable store, the main
//! context, the background fetch context, and the main delivery queue.

use crate::config::{IdentityConfig, NestoreConfig};
use crate::context::{Context, ContextInner, ContextRole, Environment};
use crate::error::StoreError;
use crate::events::EventBus;
use crate::queue::{DispatchQueue, MainQueue, SerialQueue};
use crate::store::{DurableStore, IdentifierService, SledStore};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::info;

/// Settings a stack is built with
#[derive(Debug, Clone, PartialEq)]
pub struct StackOptions {
    pub identity: IdentityConfig,
    pub main_label: String,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            main_label: "main".to_string(),
        }
    }
}

impl From<&NestoreConfig> for StackOptions {
    fn from(config: &NestoreConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            main_label: config.queues.main_label.clone(),
        }
    }
}

/// Owns the contexts every application needs
pub struct ContextStack {
    root: Context,
    main: Context,
    fetch: Context,
    main_queue: MainQueue,
    bus: Arc<EventBus>,
}

impl ContextStack {
    /// Build a stack over a store that also hands out permanent identifiers
    pub fn new<S>(store: Arc<S>, options: StackOptions, handle: &Handle) -> Self
    where
        S: DurableStore + IdentifierService + 'static,
    {
        let ids: Arc<dyn IdentifierService> = store.clone();
        Self::with_services(store, ids, options, handle)
    }

    /// Build a stack over separate store and identifier services
    pub fn with_services(
        store: Arc<dyn DurableStore>,
        ids: Arc<dyn IdentifierService>,
        options: StackOptions,
        handle: &Handle,
    ) -> Self {
        let main_queue: MainQueue = SerialQueue::spawn(options.main_label.clone(), (), handle);
        let bus = Arc::new(EventBus::new());
        let env = Arc::new(Environment {
            store,
            ids,
            bus: Arc::clone(&bus),
            main_queue: Arc::new(main_queue.clone()),
            handle: handle.clone(),
            identity: options.identity,
            fetch_context: RwLock::new(Weak::new()),
        });

        let root = ContextInner::spawn(Arc::clone(&env), None, "root", ContextRole::Root, true);
        let main = ContextInner::spawn(
            Arc::clone(&env),
            Some(&root),
            options.main_label,
            ContextRole::Main,
            true,
        );
        let fetch = ContextInner::spawn(Arc::clone(&env), None, "fetch", ContextRole::Fetch, true);
        *env.fetch_context.write() = Arc::downgrade(&fetch);

        info!(
            root = %root.id,
            main = %main.id,
            fetch = %fetch.id,
            "Context stack ready"
        );

        Self {
            root: Context::from_inner(root),
            main: Context::from_inner(main),
            fetch: Context::from_inner(fetch),
            main_queue,
            bus,
        }
    }

    /// Open a sled store under `workspace_root` as configured and build a stack over it
    pub fn open(
        workspace_root: &Path,
        config: &NestoreConfig,
        handle: &Handle,
    ) -> Result<Self, StoreError> {
        let path = config.store.resolve_path(workspace_root);
        let store =
            SledStore::open(&path)?.with_flush_on_commit(config.store.flush_on_commit);
        info!(path = %path.display(), "Opened store");
        Ok(Self::new(Arc::new(store), StackOptions::from(config), handle))
    }

    /// Context writing to the durable store
    pub fn root(&self) -> &Context {
        &self.root
    }

    /// The main-side context, child of the root
    pub fn main(&self) -> &Context {
        &self.main
    }

    /// Context executing fetch requests
    pub fn fetch_context(&self) -> &Context {
        &self.fetch
    }

    /// Default queue completions are delivered on
    pub fn main_queue(&self) -> Arc<dyn DispatchQueue> {
        Arc::new(self.main_queue.clone())
    }

    /// The main queue with its serial handle, for running closures on it directly
    pub fn main_serial_queue(&self) -> &MainQueue {
        &self.main_queue
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// New child of the main context that obtains permanent identifiers before saving
    pub fn new_private_context(&self, label: impl Into<String>) -> Context {
        self.main.child_with_policy(label, true)
    }
}
