//! Serial execution queues
//!
//! A [`SerialQueue`] is a tokio task that owns a piece of state and runs
//! submitted jobs against it one at a time, in submission order. Nothing
//! outside the queue can reach the state; callers submit closures and await
//! their results.
//!
//! Every serial queue is also a [`DispatchQueue`], the abstraction used to
//! deliver completions ("run this closure on queue Q").

use crate::error::QueueError;
use futures::executor::block_on;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

thread_local! {
    /// Queue (id, label) whose job is executing on this thread, if any
    static CURRENT_QUEUE: RefCell<Option<(u64, Arc<str>)>> = const { RefCell::new(None) };
}

/// Something that can run a closure on its own execution queue
pub trait DispatchQueue: Send + Sync {
    fn label(&self) -> &str;

    /// Schedule `job`; it runs after everything already scheduled on this queue
    fn dispatch(&self, job: Box<dyn FnOnce() + Send>);
}

/// Serial queue owning state of type `S`
pub struct SerialQueue<S> {
    id: u64,
    label: Arc<str>,
    sender: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for SerialQueue<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: Arc::clone(&self.label),
            sender: self.sender.clone(),
        }
    }
}

impl<S> fmt::Debug for SerialQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl<S: Send + 'static> SerialQueue<S> {
    /// Spawn the queue's worker task on `handle`. The task exits once every
    /// clone of the queue has been dropped and the backlog is drained.
    pub fn spawn(label: impl Into<String>, state: S, handle: &Handle) -> Self {
        static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let label: Arc<str> = Arc::from(label.into());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job<S>>();

        let worker_label = Arc::clone(&label);
        handle.spawn(async move {
            let mut state = state;
            debug!(queue = %worker_label, "Serial queue started");
            while let Some(job) = receiver.recv().await {
                CURRENT_QUEUE.with(|current| {
                    *current.borrow_mut() = Some((id, Arc::clone(&worker_label)));
                });
                let outcome = catch_unwind(AssertUnwindSafe(|| job(&mut state)));
                CURRENT_QUEUE.with(|current| *current.borrow_mut() = None);
                if outcome.is_err() {
                    error!(queue = %worker_label, "Job panicked on serial queue");
                }
            }
            debug!(queue = %worker_label, "Serial queue stopped");
        });

        Self { id, label, sender }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the calling thread is currently running a job of this queue
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| matches!(*current.borrow(), Some((id, _)) if id == self.id))
    }

    /// Enqueue a job without waiting for it
    pub fn submit<F>(&self, job: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .map_err(|_| QueueError::Closed(self.label.to_string()))
    }

    /// Run `f` on the queue and suspend until it has completed
    pub async fn perform<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let receiver = self.enqueue_with_reply(f)?;
        receiver
            .await
            .map_err(|_| QueueError::Dropped(self.label.to_string()))
    }

    /// Run `f` on the queue, blocking the calling thread until it has completed.
    ///
    /// Refuses to run from inside one of this queue's own jobs, which could
    /// never complete.
    pub fn perform_blocking<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(QueueError::Reentrant(self.label.to_string()));
        }
        let receiver = self.enqueue_with_reply(f)?;
        wait_blocking(receiver)?.map_err(|_| QueueError::Dropped(self.label.to_string()))
    }

    fn enqueue_with_reply<R, F>(&self, f: F) -> Result<oneshot::Receiver<R>, QueueError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |state| {
            // The waiter may have gone away; the job still runs to completion
            let _ = tx.send(f(state));
        })?;
        Ok(rx)
    }
}

impl<S: Send + 'static> DispatchQueue for SerialQueue<S> {
    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, job: Box<dyn FnOnce() + Send>) {
        if let Err(e) = self.submit(move |_| job()) {
            warn!(error = %e, "Dropping dispatched job");
        }
    }
}

/// Block the calling thread until `future` completes.
///
/// On a multi-thread runtime worker the wait goes through
/// [`tokio::task::block_in_place`] so other tasks keep running. A queue job on
/// a current-thread runtime cannot wait at all: the jobs it would wait for
/// share its only thread, so the call fails with [`QueueError::WouldStall`].
pub fn wait_blocking<F: Future>(future: F) -> Result<F::Output, QueueError> {
    let Ok(handle) = Handle::try_current() else {
        return Ok(block_on(future));
    };
    if matches!(handle.runtime_flavor(), RuntimeFlavor::CurrentThread) {
        let running = CURRENT_QUEUE.with(|current| {
            current.borrow().as_ref().map(|(_, label)| label.to_string())
        });
        return match running {
            Some(label) => Err(QueueError::WouldStall(label)),
            None => Ok(block_on(future)),
        };
    }
    Ok(tokio::task::block_in_place(|| block_on(future)))
}

/// Main (UI-side) queue: the default completion delivery target
pub type MainQueue = SerialQueue<()>;
