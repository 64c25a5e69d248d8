//! CLI parse: clap types for nestore. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// nestore - nested persistence contexts over a sled store
#[derive(Parser, Debug)]
#[command(name = "nestore")]
#[command(about = "Insert, query and delete records through nested persistence contexts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, both)
    #[arg(long)]
    pub log_output: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Insert a record and save it through the main and root contexts
    Insert {
        /// Entity name
        #[arg(long)]
        entity: String,
        /// Attribute as key=value (repeatable)
        #[arg(long = "attr")]
        attrs: Vec<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Change attributes of a stored record
    Update {
        /// Permanent record identifier
        id: u64,
        /// Attribute as key=value (repeatable)
        #[arg(long = "attr")]
        attrs: Vec<String>,
    },
    /// Query records through the background fetch context
    Query {
        /// Entity name
        #[arg(long)]
        entity: String,
        /// Equality filter as key=value (repeatable, all must match)
        #[arg(long = "where")]
        filters: Vec<String>,
        /// Sort key as key[:asc|:desc] (repeatable)
        #[arg(long)]
        sort: Vec<String>,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
        /// Print identifiers only
        #[arg(long)]
        ids: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show one record
    Show {
        /// Permanent record identifier
        id: u64,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Delete one record
    Delete {
        /// Permanent record identifier
        id: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

impl Commands {
    /// Stable command name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Insert { .. } => "insert",
            Commands::Update { .. } => "update",
            Commands::Query { .. } => "query",
            Commands::Show { .. } => "show",
            Commands::Delete { .. } => "delete",
            Commands::Config => "config",
        }
    }
}
