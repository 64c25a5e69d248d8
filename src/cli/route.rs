//! CLI route: run context and single route table over a context stack.

use crate::cli::parse::Commands;
use crate::cli::presentation::{format_ids, format_record, format_records};
use crate::config::{ConfigLoader, NestoreConfig};
use crate::error::CliError;
use crate::stack::ContextStack;
use crate::store::{FetchRequest, Predicate, SortDescriptor};
use crate::types::{Attributes, PermanentId, RecordId, Value};
use std::path::PathBuf;
use std::time::Instant;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Runtime context for CLI execution: configuration, the context stack and
/// the tokio runtime its queues run on.
pub struct RunContext {
    // Dropped before the runtime so queue tasks end first
    stack: ContextStack,
    runtime: Runtime,
    config: NestoreConfig,
    workspace_root: PathBuf,
}

impl RunContext {
    /// Load configuration, open the store and build the stack
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, CliError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("nestore-worker")
            .build()
            .map_err(|e| CliError::Runtime(format!("Failed to start runtime: {}", e)))?;
        let stack = ContextStack::open(&workspace_root, &config, runtime.handle())?;

        Ok(Self {
            stack,
            runtime,
            config,
            workspace_root,
        })
    }

    pub fn config(&self) -> &NestoreConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &PathBuf {
        &self.workspace_root
    }

    /// Execute a CLI command via the route table.
    pub fn execute(&self, command: &Commands) -> Result<String, CliError> {
        let started = Instant::now();
        let result = self.runtime.block_on(self.route(command));
        info!(
            command = command.name(),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        result
    }

    async fn route(&self, command: &Commands) -> Result<String, CliError> {
        match command {
            Commands::Insert {
                entity,
                attrs,
                format,
            } => self.insert(entity, attrs, format).await,
            Commands::Update { id, attrs } => self.update(*id, attrs).await,
            Commands::Query {
                entity,
                filters,
                sort,
                limit,
                ids,
                format,
            } => {
                let request = build_request(entity, filters, sort, *limit)?;
                self.query(&request, *ids, format).await
            }
            Commands::Show { id, format } => self.show(*id, format).await,
            Commands::Delete { id } => self.delete(*id).await,
            Commands::Config => self.config.to_toml().map_err(CliError::from),
        }
    }

    async fn insert(&self, entity: &str, attrs: &[String], format: &str) -> Result<String, CliError> {
        let attributes = parse_attributes(attrs)?;
        let context = self.stack.new_private_context("cli-insert");
        let record = context.insert(entity, attributes).await?;
        context.save().await?;

        debug!(id = %record.id(), "Inserted record");
        let stored = record
            .load()
            .await?
            .ok_or_else(|| CliError::NotFound(record.id().to_string()))?;
        format_record(&stored, format)
    }

    async fn update(&self, id: u64, attrs: &[String]) -> Result<String, CliError> {
        let changes = parse_attributes(attrs)?;
        let context = self.stack.new_private_context("cli-update");
        let record = context.record_with_id(permanent(id)).await?;
        context.update(&record, changes).await?;
        context.save().await?;
        Ok(format!("Updated {}", record.id()))
    }

    async fn query(&self, request: &FetchRequest, ids_only: bool, format: &str) -> Result<String, CliError> {
        let main = self.stack.main();
        if ids_only {
            let ids: Vec<RecordId> = main
                .fetch_ids(request)
                .await?
                .into_iter()
                .map(RecordId::from)
                .collect();
            return format_ids(&ids, format);
        }

        let mut records = Vec::new();
        for handle in main.fetch_records(request).await? {
            if let Some(record) = handle.load().await? {
                records.push(record);
            }
        }
        format_records(&records, format)
    }

    async fn show(&self, id: u64, format: &str) -> Result<String, CliError> {
        let record = self.stack.main().record_with_id(permanent(id)).await?;
        match record.load().await? {
            Some(found) => format_record(&found, format),
            None => Err(CliError::NotFound(record.id().to_string())),
        }
    }

    async fn delete(&self, id: u64) -> Result<String, CliError> {
        let context = self.stack.new_private_context("cli-delete");
        let record = context.record_with_id(permanent(id)).await?;
        context.delete(&record).await?;
        context.save().await?;
        Ok(format!("Deleted {}", record.id()))
    }
}

fn permanent(raw: u64) -> RecordId {
    RecordId::from(PermanentId::new(raw))
}

/// Parse `key=value` pairs; values go through [`Value::parse_literal`]
fn parse_attributes(pairs: &[String]) -> Result<Attributes, CliError> {
    let mut attributes = Attributes::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .filter(|(key, _)| !key.is_empty())
            .ok_or_else(|| CliError::Usage(format!("expected key=value, got '{}'", pair)))?;
        if attributes
            .insert(key.to_string(), Value::parse_literal(value))
            .is_some()
        {
            return Err(CliError::Usage(format!("key '{}' given more than once", key)));
        }
    }
    Ok(attributes)
}

fn build_request(
    entity: &str,
    filters: &[String],
    sort: &[String],
    limit: Option<usize>,
) -> Result<FetchRequest, CliError> {
    let mut request = FetchRequest::new(entity);

    let mut predicates: Vec<Predicate> = parse_attributes(filters)?
        .into_iter()
        .map(|(key, value)| Predicate::Equals(key, value))
        .collect();
    match predicates.len() {
        0 => {}
        1 => request = request.with_predicate(predicates.remove(0)),
        _ => request = request.with_predicate(Predicate::And(predicates)),
    }

    for spec in sort {
        let descriptor = SortDescriptor::parse(spec)
            .ok_or_else(|| CliError::Usage(format!("invalid sort key '{}'", spec)))?;
        request = request.sorted_by(descriptor);
    }
    if let Some(limit) = limit {
        request = request.with_limit(limit);
    }
    Ok(request)
}
