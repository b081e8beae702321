//! In-memory record store.

use std::collections::HashMap;

use async_trait::async_trait;
use kvm_id::DomainUuid;
use parking_lot::Mutex;

use super::{RecordStore, StoreError};
use crate::migration::{MigrationRecord, StatusPatch};

/// In-process record store with versioned conditional writes.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<DomainUuid, MigrationRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, bumping its version.
    ///
    /// Simulates a write by another party.
    pub fn insert(&self, mut record: MigrationRecord) -> u64 {
        let mut records = self.records.lock();
        let version = records.get(&record.id).map_or(1, |r| r.version + 1);
        record.version = version;
        records.insert(record.id, record);
        version
    }

    /// Remove a record, as an external cleanup would.
    pub fn remove(&self, id: &DomainUuid) -> Option<MigrationRecord> {
        self.records.lock().remove(id)
    }

    /// Copy of the current record, if any.
    pub fn snapshot(&self, id: &DomainUuid) -> Option<MigrationRecord> {
        self.records.lock().get(id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, id: &DomainUuid) -> Result<MigrationRecord, StoreError> {
        self.snapshot(id).ok_or(StoreError::NotFound(*id))
    }

    async fn create(&self, id: &DomainUuid) -> Result<(), StoreError> {
        self.records
            .lock()
            .entry(*id)
            .or_insert_with(|| MigrationRecord::empty(*id));
        Ok(())
    }

    async fn patch(
        &self,
        id: &DomainUuid,
        version: u64,
        patch: &StatusPatch,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        let record = records.get_mut(id).ok_or(StoreError::NotFound(*id))?;

        if record.version != version {
            return Err(StoreError::VersionConflict {
                id: *id,
                expected: version,
                actual: record.version,
            });
        }

        patch.apply_to(&mut record.status);
        record.version += 1;
        Ok(record.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationPhase;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryRecordStore::new();
        let id = DomainUuid::new_v4();

        store.create(&id).await.unwrap();
        let version = store
            .patch(&id, 1, &StatusPatch::phase(MigrationPhase::Bounded))
            .await
            .unwrap();
        store.create(&id).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.version, version);
        assert_eq!(record.status.phase, MigrationPhase::Bounded);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryRecordStore::new();
        let id = DomainUuid::new_v4();
        store.create(&id).await.unwrap();

        store
            .patch(&id, 1, &StatusPatch::phase(MigrationPhase::Bounded))
            .await
            .unwrap();
        let err = store
            .patch(&id, 1, &StatusPatch::phase(MigrationPhase::Failed))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(
            store.get(&id).await.unwrap().status.phase,
            MigrationPhase::Bounded
        );
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = MemoryRecordStore::new();
        let id = DomainUuid::new_v4();

        assert!(store.get(&id).await.unwrap_err().is_not_found());
        assert!(store
            .patch(&id, 1, &StatusPatch::default())
            .await
            .unwrap_err()
            .is_not_found());
    }
}
