//! Fetch translation.
//!
//! Queries never run on the caller's queue. The request is cloned and
//! executed on the stack's background fetch context; the resulting permanent
//! identifiers are then turned into handles bound to the caller's context by
//! a translation job on the caller's own queue.

use crate::completion::Completion;
use crate::context::{Context, ContextInner, ManagedRecord};
use crate::error::ContextError;
use crate::queue::wait_blocking;
use crate::store::FetchRequest;
use crate::types::{PermanentId, RecordId};
use std::sync::Arc;
use tracing::debug;

/// What a fetch hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Handles bound to the calling context
    #[default]
    Records,
    /// Bare permanent identifiers
    Identifiers,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResults {
    Records(Vec<ManagedRecord>),
    Identifiers(Vec<RecordId>),
}

impl FetchResults {
    pub fn len(&self) -> usize {
        match self {
            FetchResults::Records(records) => records.len(),
            FetchResults::Identifiers(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of the results, in store order
    pub fn ids(&self) -> Vec<RecordId> {
        match self {
            FetchResults::Records(records) => records.iter().map(ManagedRecord::id).collect(),
            FetchResults::Identifiers(ids) => ids.clone(),
        }
    }

    pub fn into_records(self) -> Option<Vec<ManagedRecord>> {
        match self {
            FetchResults::Records(records) => Some(records),
            FetchResults::Identifiers(_) => None,
        }
    }
}

impl Context {
    /// Run `request` on the background fetch context and translate the results into this context
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        mode: FetchMode,
    ) -> Result<FetchResults, ContextError> {
        let ids = execute(&self.inner, request.clone()).await?;
        match mode {
            FetchMode::Identifiers => Ok(FetchResults::Identifiers(
                ids.into_iter().map(RecordId::from).collect(),
            )),
            FetchMode::Records => {
                let cells = self
                    .inner
                    .run(move |state| {
                        ids.into_iter()
                            .map(|id| state.register_identity(RecordId::from(id)))
                            .collect::<Vec<_>>()
                    })
                    .await?;
                Ok(FetchResults::Records(
                    cells
                        .into_iter()
                        .map(|cell| ManagedRecord::new(cell, &self.inner))
                        .collect(),
                ))
            }
        }
    }

    /// Start a fetch and return immediately; `completion` receives the results
    pub fn fetch_async(
        &self,
        request: &FetchRequest,
        mode: FetchMode,
        completion: Completion<FetchResults>,
    ) {
        let context = self.clone();
        let request = request.clone();
        let default_queue = Arc::clone(&self.inner.env.main_queue);
        self.inner.env.handle.spawn(async move {
            let result = context.fetch(&request, mode).await;
            completion.deliver(result, &default_queue);
        });
    }

    /// Fetch, blocking the calling thread. Fails with a reentrancy error on
    /// this context's queue or the fetch context's queue.
    pub fn fetch_and_wait(
        &self,
        request: &FetchRequest,
        mode: FetchMode,
    ) -> Result<FetchResults, ContextError> {
        self.inner.ensure_not_on_chain()?;
        if let Some(fetcher) = self.inner.env.fetch_context.read().upgrade() {
            fetcher.ensure_not_on_chain()?;
        }
        wait_blocking(self.fetch(request, mode))?
    }

    pub async fn fetch_records(
        &self,
        request: &FetchRequest,
    ) -> Result<Vec<ManagedRecord>, ContextError> {
        match self.fetch(request, FetchMode::Records).await? {
            FetchResults::Records(records) => Ok(records),
            FetchResults::Identifiers(_) => Ok(Vec::new()),
        }
    }

    pub async fn fetch_ids(&self, request: &FetchRequest) -> Result<Vec<PermanentId>, ContextError> {
        let results = self.fetch(request, FetchMode::Identifiers).await?;
        Ok(results
            .ids()
            .into_iter()
            .filter_map(|id| id.permanent())
            .collect())
    }
}

/// Execute `request` on behalf of the background fetch context.
///
/// The fetch context's queue only does the bookkeeping; the query itself runs
/// on the blocking pool so one slow query never holds up another fetch.
async fn execute(
    caller: &Arc<ContextInner>,
    request: FetchRequest,
) -> Result<Vec<PermanentId>, ContextError> {
    let fetcher = caller
        .env
        .fetch_context
        .read()
        .upgrade()
        .ok_or(ContextError::NoFetchContext)?;
    let entity = request.entity.clone();

    fetcher.run(|state| state.queries_executed += 1).await?;
    let ids = caller
        .env
        .with_store(move |store| store.query(&request))
        .await
        .map_err(ContextError::QueryExecutionFailure)?;

    debug!(
        caller = %caller.id,
        fetcher = %fetcher.id,
        entity = %entity,
        results = ids.len(),
        "Fetch executed"
    );
    Ok(ids)
}
