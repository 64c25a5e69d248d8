//! Error types for nested persistence contexts.

use crate::types::{ContextId, PermanentId, RecordId};
use thiserror::Error;

/// Storage-related errors raised by a durable store or identifier service
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Temporary identifier {0} reached the durable store")]
    TemporaryIdentifier(RecordId),

    #[error("Record not found: {0}")]
    RecordNotFound(PermanentId),

    #[error("Store rejected the write: {0}")]
    Rejected(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

/// Validation failures detected while committing a context level
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Entity name cannot be empty")]
    EmptyEntity,

    #[error("Record {id} rejected: {reason}")]
    Rejected { id: RecordId, reason: String },

    #[error("Temporary identifier {id} belongs to another context than {context}")]
    ForeignTemporaryId { id: RecordId, context: ContextId },

    #[error("Record handle belongs to {owner}, not {context}")]
    ForeignHandle { owner: ContextId, context: ContextId },

    #[error("Unknown record: {0}")]
    UnknownRecord(RecordId),

    #[error("Record {0} is deleted in this context")]
    RecordDeleted(RecordId),

    #[error(
        "{context} would push {count} record(s) with temporary identifiers to its parent; \
         enable obtain_permanent_ids_before_saving on this context"
    )]
    TemporaryIdentifierLeak { context: ContextId, count: usize },
}

/// Serial queue plumbing errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error("Blocking call submitted to queue '{0}' from inside that queue")]
    Reentrant(String),

    #[error("Job on queue '{0}' was dropped before completing")]
    Dropped(String),

    #[error("Blocking wait from queue '{0}' would stall the current-thread runtime")]
    WouldStall(String),
}

/// Errors surfaced by context operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContextError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Commit failed: {0}")]
    CommitFailure(StoreError),

    #[error("Permanent identifier assignment failed: {0}")]
    IdentifierAssignmentFailure(StoreError),

    #[error("Query execution failed: {0}")]
    QueryExecutionFailure(StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Context {0} has been released")]
    ContextReleased(ContextId),

    #[error("No background fetch context is available; the owning stack was dropped")]
    NoFetchContext,
}

/// Configuration and logging setup errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Configuration validation failed:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

impl ContextError {
    /// Whether the error came from validation at some level
    pub fn is_validation(&self) -> bool {
        matches!(self, ContextError::Validation(_))
    }
}

/// Errors surfaced by the command-line tool
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    Usage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
