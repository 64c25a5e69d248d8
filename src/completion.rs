//! Completion continuations for asynchronous context operations.
//!
//! A [`Completion`] carries one handler for the operation's `Result` plus the
//! queues the outcome should be delivered on. It is consumed on delivery, so
//! exactly one outcome reaches the handler, exactly once.

use crate::error::ContextError;
use crate::queue::DispatchQueue;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

type Handler<T> = Box<dyn FnOnce(Result<T, ContextError>) + Send>;

pub struct Completion<T> {
    handler: Handler<T>,
    success_queue: Option<Arc<dyn DispatchQueue>>,
    failure_queue: Option<Arc<dyn DispatchQueue>>,
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("success_queue", &self.success_queue.as_ref().map(|q| q.label().to_string()))
            .field("failure_queue", &self.failure_queue.as_ref().map(|q| q.label().to_string()))
            .finish()
    }
}

impl<T: Send + 'static> Completion<T> {
    /// Deliver the outcome to `handler` on the default (main) queue
    pub fn new<F>(handler: F) -> Self
    where
        F: FnOnce(Result<T, ContextError>) + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
            success_queue: None,
            failure_queue: None,
        }
    }

    /// Build from a success/failure handler pair
    pub fn from_handlers<S, F>(on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(ContextError) + Send + 'static,
    {
        Self::new(move |result| match result {
            Ok(value) => on_success(value),
            Err(error) => on_failure(error),
        })
    }

    /// Completion that forwards the outcome into a oneshot channel
    pub fn channel() -> (Self, oneshot::Receiver<Result<T, ContextError>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    pub fn on_success_queue(mut self, queue: Arc<dyn DispatchQueue>) -> Self {
        self.success_queue = Some(queue);
        self
    }

    pub fn on_failure_queue(mut self, queue: Arc<dyn DispatchQueue>) -> Self {
        self.failure_queue = Some(queue);
        self
    }

    /// Deliver both outcomes on `queue`
    pub fn on_queue(self, queue: Arc<dyn DispatchQueue>) -> Self {
        self.on_success_queue(Arc::clone(&queue)).on_failure_queue(queue)
    }

    /// Dispatch the handler with `result` on the queue configured for that outcome,
    /// or on `default_queue` when none was configured.
    pub fn deliver(self, result: Result<T, ContextError>, default_queue: &Arc<dyn DispatchQueue>) {
        let queue = match result {
            Ok(_) => self.success_queue,
            Err(_) => self.failure_queue,
        }
        .unwrap_or_else(|| Arc::clone(default_queue));

        let handler = self.handler;
        queue.dispatch(Box::new(move || handler(result)));
    }
}
