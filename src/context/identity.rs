//! Permanent identifier pre-assignment

use crate::context::state::ContextState;
use crate::context::{Context, ManagedRecord};
use crate::error::{ContextError, StoreError, ValidationError};
use crate::store::IdentifierService;
use crate::types::RecordId;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

impl ContextState {
    /// Replace temporary identifiers of pending inserts with permanent ones.
    ///
    /// With `only` set, just those records are converted. Handles issued by
    /// this context observe the new identifiers through their shared cells.
    /// Returns how many identifiers were assigned.
    pub(crate) fn assign_permanent_ids(
        &mut self,
        service: &dyn IdentifierService,
        only: Option<&HashSet<RecordId>>,
    ) -> Result<usize, ContextError> {
        let mut by_entity: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        for (id, entity) in self.pending.temporary_inserts() {
            if only.map_or(true, |wanted| wanted.contains(&id)) {
                by_entity.entry(entity).or_default().push(id);
            }
        }

        // Ask for every entity before touching state so a failure changes nothing
        let mut assignments = Vec::new();
        for (entity, temporaries) in &by_entity {
            let permanents = service
                .assign_permanent_ids(entity, temporaries.len())
                .map_err(ContextError::IdentifierAssignmentFailure)?;
            if permanents.len() != temporaries.len() {
                return Err(ContextError::IdentifierAssignmentFailure(
                    StoreError::Rejected(format!(
                        "asked for {} identifiers for '{}', got {}",
                        temporaries.len(),
                        entity,
                        permanents.len()
                    )),
                ));
            }
            assignments.extend(temporaries.iter().copied().zip(permanents));
        }

        for (temporary, permanent) in &assignments {
            let to = RecordId::Permanent(*permanent);
            self.pending.rekey(*temporary, to);
            if let Some(mut record) = self.objects.remove(temporary) {
                record.id = to;
                self.objects.insert(to, record);
            }
            if let Some(cell) = self.identities.remove(temporary) {
                cell.set(to);
                self.identities.insert(to, cell);
            }
            if let RecordId::Temporary(temp) = temporary {
                if temp.context == self.id {
                    self.aliases.insert(*temp, *permanent);
                }
            }
        }

        if !assignments.is_empty() {
            debug!(
                context = %self.id,
                assigned = assignments.len(),
                "Obtained permanent identifiers"
            );
        }
        Ok(assignments.len())
    }
}

impl Context {
    /// Whether commits of this context first convert inserted records to permanent identifiers
    pub fn obtains_permanent_ids_before_saving(&self) -> bool {
        self.inner.obtain_permanent_ids.load(Ordering::SeqCst)
    }

    pub fn set_obtain_permanent_ids_before_saving(&self, enabled: bool) {
        self.inner
            .obtain_permanent_ids
            .store(enabled, Ordering::SeqCst);
    }

    /// Obtain permanent identifiers for the given records now.
    ///
    /// Records that already carry permanent identifiers are skipped. Returns
    /// the number of identifiers assigned.
    pub async fn obtain_permanent_ids(&self, records: &[ManagedRecord]) -> Result<usize, ContextError> {
        let mut wanted = HashSet::new();
        for record in records {
            if record.context_id() != self.id() {
                return Err(ValidationError::ForeignHandle {
                    owner: record.context_id(),
                    context: self.id(),
                }
                .into());
            }
            wanted.insert(record.id());
        }

        let service = Arc::clone(&self.inner.env.ids);
        self.inner
            .run(move |state| state.assign_permanent_ids(service.as_ref(), Some(&wanted)))
            .await?
    }
}
