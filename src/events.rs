//! In-process event bus for context save events.
//!
//! Subscriptions live in an explicit registry keyed by source context and
//! event kind, each entry tagged with its subscriber so that at most one
//! subscription exists per (source, kind, subscriber) and removal is exact.

use crate::store::ChangeSet;
use crate::types::ContextId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Posted before a context commits its pending changes
    WillSave,
    /// Posted after a context committed; carries the committed change set
    DidSave,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WillSave => "will_save",
            EventKind::DidSave => "did_save",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextEvent {
    pub source: ContextId,
    pub kind: EventKind,
    /// Whether the source writes straight to the durable store
    pub is_root: bool,
    pub changes: Arc<ChangeSet>,
    pub at: DateTime<Utc>,
}

impl ContextEvent {
    pub fn will_save(source: ContextId, is_root: bool) -> Self {
        Self::with_now(source, EventKind::WillSave, is_root, Arc::new(ChangeSet::default()))
    }

    pub fn did_save(source: ContextId, is_root: bool, changes: Arc<ChangeSet>) -> Self {
        Self::with_now(source, EventKind::DidSave, is_root, changes)
    }

    fn with_now(source: ContextId, kind: EventKind, is_root: bool, changes: Arc<ChangeSet>) -> Self {
        Self {
            source,
            kind,
            is_root,
            changes,
            at: Utc::now(),
        }
    }
}

/// Who owns a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberId {
    Context(ContextId),
    Listener(u64),
}

pub type EventHandler = Arc<dyn Fn(&ContextEvent) + Send + Sync>;

type Registry = HashMap<(ContextId, EventKind), Vec<(SubscriberId, EventHandler)>>;

#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Registry>,
    next_listener: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind` events from `source`.
    ///
    /// Returns `false` (and keeps the existing handler) if `subscriber`
    /// already holds a subscription for this source and kind.
    pub fn subscribe(
        &self,
        source: ContextId,
        kind: EventKind,
        subscriber: SubscriberId,
        handler: EventHandler,
    ) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let entries = subscriptions.entry((source, kind)).or_default();
        if entries.iter().any(|(id, _)| *id == subscriber) {
            return false;
        }
        entries.push((subscriber, handler));
        true
    }

    /// Subscribe an anonymous listener; returns its subscriber ID for later removal
    pub fn listen<F>(&self, source: ContextId, kind: EventKind, handler: F) -> SubscriberId
    where
        F: Fn(&ContextEvent) + Send + Sync + 'static,
    {
        let subscriber = SubscriberId::Listener(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.subscribe(source, kind, subscriber, Arc::new(handler));
        subscriber
    }

    /// Remove a subscription. Returns whether one existed.
    pub fn unsubscribe(&self, source: ContextId, kind: EventKind, subscriber: SubscriberId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(entries) = subscriptions.get_mut(&(source, kind)) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscriber);
        let removed = entries.len() != before;
        if entries.is_empty() {
            subscriptions.remove(&(source, kind));
        }
        removed
    }

    /// Drop every subscription whose source or subscriber is `context`
    pub fn forget_context(&self, context: ContextId) {
        let mut subscriptions = self.subscriptions.write();
        subscriptions.retain(|(source, _), entries| {
            entries.retain(|(id, _)| *id != SubscriberId::Context(context));
            *source != context && !entries.is_empty()
        });
    }

    pub fn is_subscribed(&self, source: ContextId, kind: EventKind, subscriber: SubscriberId) -> bool {
        self.subscriptions
            .read()
            .get(&(source, kind))
            .map(|entries| entries.iter().any(|(id, _)| *id == subscriber))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, source: ContextId, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .get(&(source, kind))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver `event` to every current subscriber of its source and kind.
    ///
    /// Handlers run on the posting thread after the registry lock is released,
    /// so they may subscribe or unsubscribe.
    pub fn post(&self, event: &ContextEvent) {
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .get(&(event.source, event.kind))
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(
            source = %event.source,
            kind = event.kind.as_str(),
            subscribers = handlers.len(),
            "Posting context event"
        );

        for handler in handlers {
            handler(event);
        }
    }
}
