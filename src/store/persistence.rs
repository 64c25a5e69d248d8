//! Sled-backed durable store and identifier service

use crate::error::StoreError;
use crate::store::{ChangeSet, DurableStore, FetchRequest, IdentifierService, Record};
use crate::types::{PermanentId, RecordId};
use parking_lot::Mutex;
use std::path::Path;
use tracing::debug;

const RECORDS_TREE: &str = "records";

/// Sled-based implementation of [`DurableStore`] and [`IdentifierService`]
pub struct SledStore {
    db: sled::Db,
    records: sled::Tree,
    /// Serializes read-modify-write commits
    write_lock: Mutex<()>,
    flush_on_commit: bool,
}

impl SledStore {
    /// Open (or create) a store at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Io(format!("Failed to open sled database: {}", e)))?;
        Self::from_db(db)
    }

    /// Open a throwaway in-memory store
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Io(format!("Failed to open temporary database: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let records = db.open_tree(RECORDS_TREE)?;
        Ok(Self {
            db,
            records,
            write_lock: Mutex::new(()),
            flush_on_commit: true,
        })
    }

    pub fn with_flush_on_commit(mut self, flush: bool) -> Self {
        self.flush_on_commit = flush;
        self
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Io(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }

    fn key_for(id: RecordId) -> Result<[u8; 8], StoreError> {
        id.permanent()
            .map(PermanentId::to_be_bytes)
            .ok_or(StoreError::TemporaryIdentifier(id))
    }

    fn decode(bytes: &[u8]) -> Result<Record, StoreError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl DurableStore for SledStore {
    fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        if let Some(id) = changes.ids().find(RecordId::is_temporary) {
            return Err(StoreError::TemporaryIdentifier(id));
        }

        let _guard = self.write_lock.lock();
        let mut batch = sled::Batch::default();

        for record in &changes.inserted {
            let key = Self::key_for(record.id)?;
            batch.insert(key.to_vec(), bincode::serialize(record)?);
        }

        for patch in &changes.updated {
            let key = Self::key_for(patch.id)?;
            let existing = self.records.get(key)?.ok_or_else(|| {
                StoreError::RecordNotFound(PermanentId::new(u64::from_be_bytes(key)))
            })?;
            let mut record = Self::decode(&existing)?;
            record.apply(&patch.changes);
            batch.insert(key.to_vec(), bincode::serialize(&record)?);
        }

        for id in &changes.deleted {
            batch.remove(Self::key_for(*id)?.to_vec());
        }

        self.records
            .apply_batch(batch)
            .map_err(|e| StoreError::Io(format!("Failed to apply batch: {}", e)))?;

        if self.flush_on_commit {
            self.flush()?;
        }

        debug!(
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "Committed change set to sled"
        );
        Ok(())
    }

    fn query(&self, request: &FetchRequest) -> Result<Vec<PermanentId>, StoreError> {
        let mut candidates = Vec::new();
        for item in self.records.iter() {
            let (_, value) = item?;
            let record = Self::decode(&value)?;
            if record.entity == request.entity {
                candidates.push(record);
            }
        }
        Ok(request.evaluate(candidates))
    }

    fn load(&self, id: PermanentId) -> Result<Option<Record>, StoreError> {
        match self.records.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }
}

impl IdentifierService for SledStore {
    fn assign_permanent_ids(
        &self,
        entity: &str,
        count: usize,
    ) -> Result<Vec<PermanentId>, StoreError> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            // generate_id starts at zero; keep zero free as a sentinel
            ids.push(PermanentId::new(self.db.generate_id()? + 1));
        }
        debug!(entity, count, "Assigned permanent identifiers");
        Ok(ids)
    }
}
