//! Merge rules: defaults, override order, environment mapping.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment};

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("store.path", ".nestore/store")?
        .set_default("store.flush_on_commit", true)?
        .set_default("identity.obtain_permanent_ids_by_default", false)?
        .set_default("identity.strict_temporary_ids", true)?
        .set_default("queues.main_label", "main")
}

/// `NESTORE__SECTION__KEY` environment overrides, highest precedence.
///
/// The double separator keeps these apart from the `NESTORE_LOG*` and
/// `NESTORE_ENV` variables.
pub fn environment() -> Environment {
    Environment::with_prefix("NESTORE")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
