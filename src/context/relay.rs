//! Notification relay: merge one context's committed changes into another.

use crate::context::Context;
use crate::events::{ContextEvent, EventBus, EventHandler, EventKind, SubscriberId};
use std::sync::Arc;
use tracing::{trace, warn};

impl Context {
    /// Merge every change set `source` commits into this context's registered records.
    ///
    /// The merge runs as a job on this context's queue. The subscription holds
    /// this context weakly. Returns `false` if already observing `source`.
    pub fn observe(&self, source: &Context) -> bool {
        let observer = Arc::downgrade(&self.inner);
        let handler: EventHandler = Arc::new(move |event: &ContextEvent| {
            let Some(observer) = observer.upgrade() else {
                return;
            };
            let changes = Arc::clone(&event.changes);
            let from = event.source;
            let merged = observer.queue.submit(move |state| {
                state.merge(&changes);
                trace!(context = %state.id, source = %from, "Merged committed changes");
            });
            if let Err(e) = merged {
                warn!(context = %observer.id, error = %e, "Dropping merge for closed context");
            }
        });

        let bus = &source.inner.env.bus;
        let added = bus.subscribe(
            source.id(),
            EventKind::DidSave,
            SubscriberId::Context(self.id()),
            handler,
        );
        if added && !Arc::ptr_eq(bus, &self.inner.env.bus) {
            self.remember_foreign_bus(bus);
        }
        added
    }

    /// Record a bus outside this stack so the subscription is dropped with the context
    fn remember_foreign_bus(&self, bus: &Arc<EventBus>) {
        let mut buses = self.inner.foreign_buses.lock();
        buses.retain(|known| known.strong_count() > 0);
        if !buses.iter().any(|known| known.as_ptr() == Arc::as_ptr(bus)) {
            buses.push(Arc::downgrade(bus));
        }
    }

    /// Stop merging changes from `source`. Returns whether a subscription existed.
    pub fn stop_observing(&self, source: &Context) -> bool {
        source.inner.env.bus.unsubscribe(
            source.id(),
            EventKind::DidSave,
            SubscriberId::Context(self.id()),
        )
    }

    pub fn is_observing(&self, source: &Context) -> bool {
        source.inner.env.bus.is_subscribed(
            source.id(),
            EventKind::DidSave,
            SubscriberId::Context(self.id()),
        )
    }
}
