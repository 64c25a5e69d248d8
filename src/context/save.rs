//! Save propagation.
//!
//! A save commits the caller's context into its parent, then the parent into
//! its own parent, and so on until the root writes to the durable store. Each
//! level's work runs as jobs on that level's queue; the propagation itself is
//! an async chain that suspends between levels without occupying any queue.
//!
//! Per level:
//! 1. post `WillSave`;
//! 2. on the level's queue: obtain permanent identifiers if the level asks
//!    for them (the root always does), snapshot the pending changes and
//!    validate them;
//! 3. non-root: absorb the snapshot into the parent on the parent's queue,
//!    then clear the committed entries on the level's queue. Root: write the
//!    snapshot to the store and clear it inside the same job;
//! 4. post `DidSave` with the committed change set.
//!
//! The first failure stops the walk. Pending changes of the failing level and
//! every level above it stay as they were.

use crate::completion::Completion;
use crate::context::state::ContextState;
use crate::context::{Context, ContextInner, Validator};
use crate::error::{ContextError, ValidationError};
use crate::events::ContextEvent;
use crate::queue::wait_blocking;
use crate::store::{ChangeSet, IdentifierService, Record};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Save gates held by one propagation, child first
type Gates = Vec<OwnedMutexGuard<()>>;

impl Context {
    /// Commit this context and every ancestor, bottom-up, ending in the durable store
    pub async fn save(&self) -> Result<(), ContextError> {
        let (result, _gates) = propagate(Arc::clone(&self.inner)).await;
        result
    }

    /// Start a save and return immediately.
    ///
    /// `completion` receives the outcome once the root has committed, or the
    /// first error. It runs on its configured queue, the stack's main queue by
    /// default. Saves started this way on one context run in call order.
    pub fn save_async(&self, completion: Completion<()>) {
        let inner = Arc::clone(&self.inner);
        let default_queue = Arc::clone(&inner.env.main_queue);
        let handle = inner.env.handle.clone();
        let (finished, next) = oneshot::channel();
        let previous = inner.save_tail.lock().replace(next);
        handle.spawn(async move {
            // Start after the previous save_async of this context
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let (result, gates) = propagate(inner).await;
            // Deliver while still holding the gates so saves of one context
            // report in the order they ran
            completion.deliver(result, &default_queue);
            drop(gates);
            let _ = finished.send(());
        });
    }

    /// Save and block the calling thread until the root has committed.
    ///
    /// Fails with a reentrancy error when called from a job of this context's
    /// queue or of any ancestor's queue, and with a stall error from any queue
    /// job on a current-thread runtime.
    pub fn save_and_wait(&self) -> Result<(), ContextError> {
        self.inner.ensure_not_on_chain()?;
        wait_blocking(self.save())?
    }
}

async fn propagate(start: Arc<ContextInner>) -> (Result<(), ContextError>, Gates) {
    let origin = start.id;
    let mut gates = Gates::new();
    let mut level = start;
    let mut depth = 0usize;

    loop {
        gates.push(Arc::clone(&level.save_gate).lock_owned().await);
        depth += 1;

        if let Err(e) = commit_level(&level).await {
            error!(
                origin = %origin,
                context = %level.id,
                level = depth,
                error = %e,
                "Save failed"
            );
            return (Err(e), gates);
        }

        match level.parent() {
            Ok(Some(parent)) => level = parent,
            Ok(None) => break,
            Err(e) => return (Err(e), gates),
        }
    }

    info!(origin = %origin, levels = depth, "Save reached the durable store");
    (Ok(()), gates)
}

async fn commit_level(level: &Arc<ContextInner>) -> Result<(), ContextError> {
    let env = Arc::clone(&level.env);
    let context = level.id;
    let is_root = level.is_root();
    env.bus.post(&ContextEvent::will_save(context, is_root));

    let preassign = is_root || level.obtain_permanent_ids.load(Ordering::SeqCst);
    let validator = level.validator.read().clone();
    let ids = Arc::clone(&env.ids);

    let changes = if is_root {
        let store = Arc::clone(&env.store);
        level
            .run(move |state| -> Result<ChangeSet, ContextError> {
                let (changes, watermark) =
                    prepare(state, ids.as_ref(), preassign, validator.as_ref())?;
                if let Err(e) = store.commit(&changes) {
                    state.pending.release_in_flight();
                    return Err(ContextError::CommitFailure(e));
                }
                state.complete_commit(watermark, &changes);
                Ok(changes)
            })
            .await??
    } else {
        let parent = level.parent()?.ok_or(ContextError::ContextReleased(context))?;
        let strict = env.identity.strict_temporary_ids;

        let (changes, watermark) = level
            .run(move |state| -> Result<(ChangeSet, u64), ContextError> {
                let (changes, watermark) =
                    prepare(state, ids.as_ref(), preassign, validator.as_ref())?;
                let leaked = changes.temporary_ids().len();
                if leaked > 0 {
                    if strict {
                        state.pending.release_in_flight();
                        return Err(ValidationError::TemporaryIdentifierLeak {
                            context,
                            count: leaked,
                        }
                        .into());
                    }
                    warn!(
                        context = %context,
                        count = leaked,
                        "Pushing temporary identifiers to parent; the root will assign permanent ones"
                    );
                }
                Ok((changes, watermark))
            })
            .await??;

        let pushed = Arc::new(changes);
        let incoming = Arc::clone(&pushed);
        let absorbed = parent
            .run(move |state| state.pending.absorb(&incoming))
            .await
            .and_then(|applied| applied.map_err(ContextError::from));
        if let Err(e) = absorbed {
            level.queue.submit(|state| state.pending.release_in_flight())?;
            return Err(e);
        }

        let committed = Arc::clone(&pushed);
        level
            .run(move |state| state.complete_commit(watermark, &committed))
            .await?;
        Arc::try_unwrap(pushed).unwrap_or_else(|shared| (*shared).clone())
    };

    debug!(
        context = %context,
        root = is_root,
        inserted = changes.inserted.len(),
        updated = changes.updated.len(),
        deleted = changes.deleted.len(),
        "Committed context level"
    );
    env.bus
        .post(&ContextEvent::did_save(context, is_root, Arc::new(changes)));
    Ok(())
}

/// Obtain identifiers if asked, then snapshot and validate the pending changes
fn prepare(
    state: &mut ContextState,
    ids: &dyn IdentifierService,
    preassign: bool,
    validator: Option<&Validator>,
) -> Result<(ChangeSet, u64), ContextError> {
    if preassign {
        state.assign_permanent_ids(ids, None)?;
    }
    let (changes, watermark) = state.pending.snapshot();
    if let Err(e) = validate(&changes, validator) {
        state.pending.release_in_flight();
        return Err(e.into());
    }
    Ok((changes, watermark))
}

fn validate(changes: &ChangeSet, validator: Option<&Validator>) -> Result<(), ValidationError> {
    for record in &changes.inserted {
        if record.entity.is_empty() {
            return Err(ValidationError::EmptyEntity);
        }
        if let Some(validator) = validator {
            validator(record).map_err(|reason| ValidationError::Rejected {
                id: record.id,
                reason,
            })?;
        }
    }

    // Updates are validated on their changed attributes only
    if let Some(validator) = validator {
        for patch in &changes.updated {
            let partial = Record::new(patch.id, patch.entity.clone(), patch.changes.clone());
            validator(&partial).map_err(|reason| ValidationError::Rejected {
                id: patch.id,
                reason,
            })?;
        }
    }
    Ok(())
}
