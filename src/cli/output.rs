//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::{CliError, ContextError};

/// Map errors to a single line for CLI output.
pub fn map_error(e: &CliError) -> String {
    match e {
        CliError::Context(ContextError::Validation(inner)) => format!("Rejected: {}", inner),
        other => other.to_string(),
    }
}
