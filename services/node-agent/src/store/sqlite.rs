//! SQLite-backed record store.
//!
//! Records are stored one row per domain with the status serialized as JSON
//! in the same camelCase shape the cluster schema uses. Conditional patches
//! compare and bump the version inside a single transaction.

use std::path::Path;

use async_trait::async_trait;
use kvm_id::DomainUuid;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{RecordStore, StoreError};
use crate::migration::{MigrationRecord, MigrationStatus, StatusPatch};

/// Durable local record store.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Record store schema initialized");
        Ok(())
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn decode_row(id: &DomainUuid, version: i64, status: &str) -> Result<MigrationRecord, StoreError> {
    let version = u64::try_from(version)
        .map_err(|_| StoreError::Invalid(format!("negative version {version} for {id}")))?;
    let status: MigrationStatus = serde_json::from_str(status)
        .map_err(|e| StoreError::Invalid(format!("status of {id}: {e}")))?;

    Ok(MigrationRecord {
        id: *id,
        version,
        status,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, id: &DomainUuid) -> Result<MigrationRecord, StoreError> {
        let row: Option<(i64, String)> = self
            .conn
            .lock()
            .query_row(
                "SELECT version, status FROM migrations WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (version, status) = row.ok_or(StoreError::NotFound(*id))?;
        decode_row(id, version, &status)
    }

    async fn create(&self, id: &DomainUuid) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let status = serde_json::to_string(&MigrationStatus::default())
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        self.conn.lock().execute(
            "INSERT OR IGNORE INTO migrations (id, version, status, created_at, updated_at)
             VALUES (?1, 1, ?2, ?3, ?3)",
            params![id.to_string(), status, now],
        )?;
        Ok(())
    }

    async fn patch(
        &self,
        id: &DomainUuid,
        version: u64,
        patch: &StatusPatch,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT version, status FROM migrations WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (stored_version, status) = row.ok_or(StoreError::NotFound(*id))?;
        let mut record = decode_row(id, stored_version, &status)?;

        if record.version != version {
            return Err(StoreError::VersionConflict {
                id: *id,
                expected: version,
                actual: record.version,
            });
        }

        patch.apply_to(&mut record.status);
        let status = serde_json::to_string(&record.status)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let next_version = stored_version + 1;

        tx.execute(
            "UPDATE migrations SET version = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                next_version,
                status,
                chrono::Utc::now().timestamp(),
                id.to_string()
            ],
        )?;
        tx.commit()?;

        Ok(record.version + 1)
    }
}
