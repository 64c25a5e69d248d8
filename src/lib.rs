//! nestore: nested, queue-affine persistence contexts
//!
//! Contexts form a tree whose root commits to a durable store. Every context
//! runs its work on its own serial queue. Saves propagate bottom-up through
//! the parent chain; fetches run on a background context and are translated
//! into handles bound to the caller's context.

pub mod cli;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod logging;
pub mod queue;
pub mod stack;
pub mod store;
pub mod types;

pub use completion::Completion;
pub use context::{Context, ContextRole, FetchMode, FetchResults, ManagedRecord};
pub use error::{ContextError, QueueError, StoreError, ValidationError};
pub use stack::{ContextStack, StackOptions};
pub use store::{ChangeSet, FetchRequest, Predicate, Record, SledStore, SortDescriptor};
pub use types::{attributes, Attributes, ContextId, PermanentId, RecordId, Value};
