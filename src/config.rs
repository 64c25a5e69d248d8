//! Configuration System
//!
//! Layered configuration built with the `config` crate: built-in defaults,
//! the global file, workspace files, then `NESTORE__*` environment variables.

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NestoreConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Durable store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Sled directory, relative to the workspace root unless absolute
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Flush to disk after every root commit
    #[serde(default = "default_true")]
    pub flush_on_commit: bool,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".nestore/store")
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            flush_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// Store directory resolved against `workspace_root`
    pub fn resolve_path(&self, workspace_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            workspace_root.join(&self.path)
        }
    }
}

/// Identifier policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Initial `obtain_permanent_ids_before_saving` for contexts made with `Context::new_child`
    #[serde(default)]
    pub obtain_permanent_ids_by_default: bool,

    /// Fail a save that would push temporary identifiers into a parent
    #[serde(default = "default_true")]
    pub strict_temporary_ids: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            obtain_permanent_ids_by_default: false,
            strict_temporary_ids: true,
        }
    }
}

/// Queue naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_main_label")]
    pub main_label: String,
}

fn default_main_label() -> String {
    "main".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            main_label: default_main_label(),
        }
    }
}

impl NestoreConfig {
    /// Validate the entire configuration, reporting every problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.store.path.as_os_str().is_empty() {
            problems.push("store.path: cannot be empty".to_string());
        }
        if self.queues.main_label.trim().is_empty() {
            problems.push("queues.main_label: cannot be empty".to_string());
        }
        problems.extend(crate::logging::validate(&self.logging));

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Render as TOML, in the layout the config files use
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Load(e.to_string()))
    }
}

/// Loads [`NestoreConfig`] from its layered sources
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Precedence (lowest to highest): defaults, global file, `config/config.toml`,
    /// `config/{NESTORE_ENV}.toml`, `NESTORE__*` environment variables.
    pub fn load(workspace_root: &Path) -> Result<NestoreConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let config = builder
            .add_source(merge::merge_policy::environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load one TOML file over the defaults
    pub fn load_from_file(path: &Path) -> Result<NestoreConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Load(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let config = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
