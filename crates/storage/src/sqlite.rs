//! SQLite-backed `SyncStorage`.
//!
//! A single `rusqlite::Connection` guarded by a mutex; every call runs on the
//! blocking pool via `tokio::task::spawn_blocking` so the async runtime never
//! waits on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::StorageError;
use crate::record::{AuditRecord, EntityRef, OperationRecord, Payload, SnapshotRecord};
use crate::timestamp::now_timestamp;
use crate::traits::SyncStorage;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operations (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  parameters_schema TEXT NOT NULL,
  parameters BLOB NOT NULL,
  result_schema TEXT,
  result BLOB,
  failure_reason TEXT,
  version INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS operations_owner_created
  ON operations(owner_id, created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS snapshots (
  operation_id TEXT NOT NULL,
  sequence INTEGER NOT NULL,
  entity_system TEXT NOT NULL,
  entity_type TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  before_schema TEXT,
  before_state BLOB,
  captured_at TEXT NOT NULL,
  PRIMARY KEY (operation_id, sequence),
  FOREIGN KEY (operation_id) REFERENCES operations(id)
);

CREATE TABLE IF NOT EXISTS audit_entries (
  id TEXT PRIMARY KEY,
  operation_id TEXT NOT NULL,
  actor TEXT NOT NULL,
  action TEXT NOT NULL,
  outcome TEXT NOT NULL,
  detail TEXT,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS audit_entries_operation
  ON audit_entries(operation_id, recorded_at, id);

CREATE TRIGGER IF NOT EXISTS audit_entries_no_update
BEFORE UPDATE ON audit_entries
BEGIN
  SELECT RAISE(ABORT, 'audit_entries is append-only');
END;
";

const OPERATION_COLUMNS: &str = "id, owner_id, kind, status, parameters_schema, parameters,
    result_schema, result, failure_reason, version, created_at, updated_at";

/// `SyncStorage` on top of a SQLite database.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database file, configure pragmas and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| {
            StorageError::Backend(format!(
                "failed to open sqlite database at {}: {e}",
                path.display()
            ))
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| StorageError::Backend(format!("failed to configure sqlite pragmas: {e}")))?;
        Self::from_connection(conn)
    }

    /// A private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(backend)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA_V1)
            .map_err(|e| StorageError::Backend(format!("failed to apply schema: {e}")))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now_timestamp()],
        )
        .map_err(backend)?;
        tracing::debug!(schema_version = SCHEMA_VERSION, "sqlite storage ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl SyncStorage for SqliteStorage {
    async fn insert_operation(&self, record: &OperationRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let (result_schema, result) = split_payload(record.result.as_ref());
            conn.execute(
                &format!(
                    "INSERT INTO operations({OPERATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    record.id,
                    record.owner_id,
                    record.kind,
                    record.status,
                    record.parameters.schema,
                    record.parameters.bytes,
                    result_schema,
                    result,
                    record.failure_reason,
                    record.version,
                    record.created_at,
                    record.updated_at,
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StorageError::AlreadyExists {
                        operation_id: record.id.clone(),
                    }
                } else {
                    backend(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn update_operation(
        &self,
        record: &OperationRecord,
        expected_version: i64,
    ) -> Result<i64, StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let new_version = expected_version + 1;
            let (result_schema, result) = split_payload(record.result.as_ref());
            let changed = conn
                .execute(
                    "UPDATE operations SET
                        owner_id = ?2, kind = ?3, status = ?4,
                        parameters_schema = ?5, parameters = ?6,
                        result_schema = ?7, result = ?8, failure_reason = ?9,
                        version = ?10, created_at = ?11, updated_at = ?12
                     WHERE id = ?1 AND version = ?13",
                    params![
                        record.id,
                        record.owner_id,
                        record.kind,
                        record.status,
                        record.parameters.schema,
                        record.parameters.bytes,
                        result_schema,
                        result,
                        record.failure_reason,
                        new_version,
                        record.created_at,
                        record.updated_at,
                        expected_version,
                    ],
                )
                .map_err(backend)?;
            if changed == 1 {
                return Ok(new_version);
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT version FROM operations WHERE id = ?1",
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            match exists {
                Some(_) => Err(StorageError::ConcurrentConflict {
                    operation_id: record.id,
                    expected_version,
                }),
                None => Err(StorageError::OperationNotFound {
                    operation_id: record.id,
                }),
            }
        })
        .await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<OperationRecord, StorageError> {
        let operation_id = operation_id.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1"),
                    params![operation_id],
                    operation_from_row,
                )
                .optional()
                .map_err(backend)?;
            found.ok_or(StorageError::OperationNotFound { operation_id })
        })
        .await
    }

    async fn list_operations(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StorageError> {
        let owner_id = owner_id.to_string();
        // SQLite treats a negative LIMIT as "no limit".
        let limit = if limit == 0 {
            -1
        } else {
            i64::try_from(limit).unwrap_or(i64::MAX)
        };
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {OPERATION_COLUMNS} FROM operations
                     WHERE owner_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![owner_id, limit], operation_from_row)
                .map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let owner_exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM operations WHERE id = ?1",
                    params![record.operation_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            if owner_exists.is_none() {
                return Err(StorageError::OperationNotFound {
                    operation_id: record.operation_id,
                });
            }

            let (before_schema, before_state) = split_payload(record.before_state.as_ref());
            tx.execute(
                "INSERT INTO snapshots(
                    operation_id, sequence, entity_system, entity_type, entity_id,
                    before_schema, before_state, captured_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.operation_id,
                    record.sequence,
                    record.entity.system,
                    record.entity.entity_type,
                    record.entity.entity_id,
                    before_schema,
                    before_state,
                    record.captured_at,
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StorageError::DuplicateSnapshot {
                        operation_id: record.operation_id.clone(),
                        sequence: record.sequence,
                    }
                } else {
                    backend(e)
                }
            })?;
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn list_snapshots(
        &self,
        operation_id: &str,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        let operation_id = operation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT operation_id, sequence, entity_system, entity_type, entity_id,
                            before_schema, before_state, captured_at
                     FROM snapshots WHERE operation_id = ?1
                     ORDER BY sequence ASC",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![operation_id], |row| {
                    Ok(SnapshotRecord {
                        operation_id: row.get(0)?,
                        sequence: row.get(1)?,
                        entity: EntityRef {
                            system: row.get(2)?,
                            entity_type: row.get(3)?,
                            entity_id: row.get(4)?,
                        },
                        before_state: join_payload(row.get(5)?, row.get(6)?),
                        captured_at: row.get(7)?,
                    })
                })
                .map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }

    async fn purge_snapshots(
        &self,
        captured_before: &str,
        eligible_statuses: &[&str],
    ) -> Result<usize, StorageError> {
        if eligible_statuses.is_empty() {
            return Ok(0);
        }
        let captured_before = captured_before.to_string();
        let statuses: Vec<String> = eligible_statuses.iter().map(|s| s.to_string()).collect();
        self.with_conn(move |conn| {
            let placeholders = (0..statuses.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "DELETE FROM snapshots
                 WHERE captured_at < ?1
                   AND operation_id IN (
                     SELECT id FROM operations WHERE status IN ({placeholders})
                   )"
            );
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&captured_before];
            values.extend(statuses.iter().map(|s| s as &dyn rusqlite::ToSql));
            conn.execute(&sql, values.as_slice()).map_err(backend)
        })
        .await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_entries(
                    id, operation_id, actor, action, outcome, detail, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    record.operation_id,
                    record.actor,
                    record.action,
                    record.outcome,
                    record.detail,
                    record.recorded_at,
                ],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn list_audit(&self, operation_id: &str) -> Result<Vec<AuditRecord>, StorageError> {
        let operation_id = operation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, operation_id, actor, action, outcome, detail, recorded_at
                     FROM audit_entries WHERE operation_id = ?1
                     ORDER BY recorded_at ASC, id ASC",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![operation_id], |row| {
                    Ok(AuditRecord {
                        id: row.get(0)?,
                        operation_id: row.get(1)?,
                        actor: row.get(2)?,
                        action: row.get(3)?,
                        outcome: row.get(4)?,
                        detail: row.get(5)?,
                        recorded_at: row.get(6)?,
                    })
                })
                .map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<OperationRecord> {
    Ok(OperationRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        parameters: Payload {
            schema: row.get(4)?,
            bytes: row.get(5)?,
        },
        result: join_payload(row.get(6)?, row.get(7)?),
        failure_reason: row.get(8)?,
        version: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn split_payload(payload: Option<&Payload>) -> (Option<String>, Option<Vec<u8>>) {
    match payload {
        Some(p) => (Some(p.schema.clone()), Some(p.bytes.clone())),
        None => (None, None),
    }
}

fn join_payload(schema: Option<String>, bytes: Option<Vec<u8>>) -> Option<Payload> {
    match (schema, bytes) {
        (Some(schema), Some(bytes)) => Some(Payload { schema, bytes }),
        _ => None,
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn backend(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(id: &str) -> OperationRecord {
        OperationRecord {
            id: id.to_string(),
            owner_id: "7".to_string(),
            kind: "sync".to_string(),
            status: "pending".to_string(),
            parameters: Payload {
                schema: "sync.parameters/1".to_string(),
                bytes: b"{}".to_vec(),
            },
            result: None,
            failure_reason: None,
            version: 0,
            created_at: "2025-01-01T00:00:00.000000Z".to_string(),
            updated_at: "2025-01-01T00:00:00.000000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn reopening_a_file_database_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracksync.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.insert_operation(&operation("op-1")).await.unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        let loaded = storage.get_operation("op-1").await.unwrap();
        assert_eq!(loaded, operation("op-1"));
    }

    #[tokio::test]
    async fn audit_entries_reject_updates() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .append_audit(&AuditRecord {
                id: "a-1".to_string(),
                operation_id: "op-1".to_string(),
                actor: "7".to_string(),
                action: "created".to_string(),
                outcome: "ok".to_string(),
                detail: None,
                recorded_at: "2025-01-01T00:00:00.000000Z".to_string(),
            })
            .await
            .unwrap();

        let result = storage
            .with_conn(|conn| {
                conn.execute("UPDATE audit_entries SET outcome = 'tampered'", [])
                    .map_err(backend)
            })
            .await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }
}
