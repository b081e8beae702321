//! Migration record persistence.
//!
//! The record store is the cluster-visible home of `MigrationRecord`s. It is
//! optimistically concurrent: every record carries a version, and patches
//! are applied only if the caller's version is still current.
//!
//! Two backends are provided:
//! - `MemoryRecordStore`: in-process, for tests and inspection
//! - `SqliteRecordStore`: durable local store used by the agent binary

mod memory;
mod sqlite;

use async_trait::async_trait;
use kvm_id::DomainUuid;
use thiserror::Error;

use crate::migration::{MigrationRecord, StatusPatch};

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("migration record not found: {0}")]
    NotFound(DomainUuid),

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: DomainUuid,
        expected: u64,
        actual: u64,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored record: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Cluster record store interface.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record together with its current version.
    async fn get(&self, id: &DomainUuid) -> Result<MigrationRecord, StoreError>;

    /// Create an empty record. Succeeds if the record already exists.
    async fn create(&self, id: &DomainUuid) -> Result<(), StoreError>;

    /// Apply `patch` if the stored version still equals `version`.
    ///
    /// Returns the new version.
    async fn patch(
        &self,
        id: &DomainUuid,
        version: u64,
        patch: &StatusPatch,
    ) -> Result<u64, StoreError>;
}
