//! Flat-file `SyncStorage`.
//!
//! Layout under the data directory:
//!
//! ```text
//! operations/<operation_id>.json
//! snapshots/<operation_id>/<sequence, zero-padded>.json
//! audit/<operation_id>/<audit_id>.json
//! ```
//!
//! Every record is written to a temporary file in the target directory,
//! fsynced, then renamed into place, so a reader sees either the previous
//! file or the complete new one. Read-modify-write sequences (OCC updates,
//! snapshot inserts, purges) are serialized by an in-process lock; one
//! process owns a data directory at a time.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::record::{AuditRecord, OperationRecord, SnapshotRecord};
use crate::traits::SyncStorage;

const OPERATIONS_DIR: &str = "operations";
const SNAPSHOTS_DIR: &str = "snapshots";
const AUDIT_DIR: &str = "audit";

/// `SyncStorage` on top of a directory of JSON files.
#[derive(Clone)]
pub struct FileStorage {
    root: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl FileStorage {
    /// Open (creating if needed) a data directory.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        for dir in [OPERATIONS_DIR, SNAPSHOTS_DIR, AUDIT_DIR] {
            fs::create_dir_all(root.join(dir)).map_err(|e| {
                StorageError::Backend(format!(
                    "failed to create {}: {e}",
                    root.join(dir).display()
                ))
            })?;
        }
        tracing::debug!(root = %root.display(), "file storage ready");
        Ok(Self {
            root: Arc::new(root.to_path_buf()),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Run `f` on the blocking pool, optionally holding the write lock.
    async fn blocking<T, F>(&self, exclusive: bool, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StorageError> + Send + 'static,
    {
        let root = Arc::clone(&self.root);
        let lock = Arc::clone(&self.write_lock);
        tokio::task::spawn_blocking(move || {
            if exclusive {
                let _guard = lock
                    .lock()
                    .map_err(|_| StorageError::Backend("file storage lock poisoned".into()))?;
                f(&root)
            } else {
                f(&root)
            }
        })
        .await
        .map_err(|e| StorageError::Backend(format!("file storage task failed: {e}")))?
    }
}

fn operation_path(root: &Path, operation_id: &str) -> Result<PathBuf, StorageError> {
    Ok(root
        .join(OPERATIONS_DIR)
        .join(format!("{}.json", safe_component(operation_id)?)))
}

fn snapshot_dir(root: &Path, operation_id: &str) -> Result<PathBuf, StorageError> {
    Ok(root.join(SNAPSHOTS_DIR).join(safe_component(operation_id)?))
}

fn audit_dir(root: &Path, operation_id: &str) -> Result<PathBuf, StorageError> {
    Ok(root.join(AUDIT_DIR).join(safe_component(operation_id)?))
}

/// Ids become file names; reject anything that could escape the directory.
fn safe_component(id: &str) -> Result<&str, StorageError> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || id.contains("..")
        || id.contains('\0')
    {
        return Err(StorageError::Backend(format!(
            "identifier '{id}' is not a valid file name"
        )));
    }
    Ok(id)
}

/// Atomically write `value` as JSON to `path`.
///
/// With `create_new`, fails with `ErrorKind::AlreadyExists` instead of
/// replacing an existing file.
fn write_json<T: Serialize>(path: &Path, value: &T, create_new: bool) -> Result<(), WriteError> {
    let dir = path
        .parent()
        .ok_or_else(|| WriteError::Storage(StorageError::Backend("path has no parent".into())))?;
    fs::create_dir_all(dir).map_err(io_err)?;

    let bytes = serde_json::to_vec_pretty(value).map_err(|e| WriteError::Storage(e.into()))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;

    if create_new {
        tmp.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                WriteError::Exists
            } else {
                io_err(e.error)
            }
        })?;
    } else {
        tmp.persist(path).map_err(|e| io_err(e.error))?;
    }
    if let Err(e) = sync_dir(dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "directory fsync failed; last rename may not survive a crash");
    }
    Ok(())
}

/// Fsync a directory so a rename inside it is durable.
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

enum WriteError {
    Exists,
    Storage(StorageError),
}

fn io_err(e: std::io::Error) -> WriteError {
    WriteError::Storage(StorageError::Backend(e.to_string()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Backend(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// All `*.json` files of a directory; temp files and a missing directory are
/// skipped.
fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(PathBuf, T)>, StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StorageError::Backend(format!(
                "failed to list {}: {e}",
                dir.display()
            )))
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(value) = read_json(&path)? {
            out.push((path, value));
        }
    }
    Ok(out)
}

#[async_trait]
impl SyncStorage for FileStorage {
    async fn insert_operation(&self, record: &OperationRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.blocking(true, move |root| {
            let path = operation_path(root, &record.id)?;
            write_json(&path, &record, true).map_err(|e| match e {
                WriteError::Exists => StorageError::AlreadyExists {
                    operation_id: record.id.clone(),
                },
                WriteError::Storage(e) => e,
            })
        })
        .await
    }

    async fn update_operation(
        &self,
        record: &OperationRecord,
        expected_version: i64,
    ) -> Result<i64, StorageError> {
        let mut record = record.clone();
        self.blocking(true, move |root| {
            let path = operation_path(root, &record.id)?;
            let stored: OperationRecord =
                read_json(&path)?.ok_or_else(|| StorageError::OperationNotFound {
                    operation_id: record.id.clone(),
                })?;
            if stored.version != expected_version {
                return Err(StorageError::ConcurrentConflict {
                    operation_id: record.id.clone(),
                    expected_version,
                });
            }
            record.version = expected_version + 1;
            write_json(&path, &record, false).map_err(|e| match e {
                WriteError::Exists => StorageError::Backend("unexpected clobber refusal".into()),
                WriteError::Storage(e) => e,
            })?;
            Ok(record.version)
        })
        .await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<OperationRecord, StorageError> {
        let operation_id = operation_id.to_string();
        self.blocking(false, move |root| {
            let path = operation_path(root, &operation_id)?;
            read_json(&path)?.ok_or(StorageError::OperationNotFound { operation_id })
        })
        .await
    }

    async fn list_operations(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StorageError> {
        let owner_id = owner_id.to_string();
        self.blocking(false, move |root| {
            let mut records: Vec<OperationRecord> =
                read_json_dir::<OperationRecord>(&root.join(OPERATIONS_DIR))?
                    .into_iter()
                    .map(|(_, record)| record)
                    .filter(|record| record.owner_id == owner_id)
                    .collect();
            records.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.id.cmp(&a.id))
            });
            if limit > 0 {
                records.truncate(limit);
            }
            Ok(records)
        })
        .await
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.blocking(true, move |root| {
            if !operation_path(root, &record.operation_id)?.exists() {
                return Err(StorageError::OperationNotFound {
                    operation_id: record.operation_id.clone(),
                });
            }
            let path = snapshot_dir(root, &record.operation_id)?
                .join(format!("{:020}.json", record.sequence));
            write_json(&path, &record, true).map_err(|e| match e {
                WriteError::Exists => StorageError::DuplicateSnapshot {
                    operation_id: record.operation_id.clone(),
                    sequence: record.sequence,
                },
                WriteError::Storage(e) => e,
            })
        })
        .await
    }

    async fn list_snapshots(
        &self,
        operation_id: &str,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        let operation_id = operation_id.to_string();
        self.blocking(false, move |root| {
            let mut records: Vec<SnapshotRecord> =
                read_json_dir::<SnapshotRecord>(&snapshot_dir(root, &operation_id)?)?
                    .into_iter()
                    .map(|(_, record)| record)
                    .collect();
            records.sort_by_key(|record| record.sequence);
            Ok(records)
        })
        .await
    }

    async fn purge_snapshots(
        &self,
        captured_before: &str,
        eligible_statuses: &[&str],
    ) -> Result<usize, StorageError> {
        let captured_before = captured_before.to_string();
        let statuses: Vec<String> = eligible_statuses.iter().map(|s| s.to_string()).collect();
        self.blocking(true, move |root| {
            let snapshots_root = root.join(SNAPSHOTS_DIR);
            let operation_dirs = fs::read_dir(&snapshots_root)
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            let mut purged = 0;
            for entry in operation_dirs {
                let dir = entry
                    .map_err(|e| StorageError::Backend(e.to_string()))?
                    .path();
                let Some(operation_id) = dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let owner: Option<OperationRecord> =
                    read_json(&operation_path(root, operation_id)?)?;
                let eligible = owner.is_some_and(|op| statuses.iter().any(|s| *s == op.status));
                if !eligible {
                    continue;
                }

                for (path, snapshot) in read_json_dir::<SnapshotRecord>(&dir)? {
                    if snapshot.captured_at < captured_before {
                        fs::remove_file(&path)
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                        purged += 1;
                    }
                }
                // Only succeeds once the directory is empty.
                let _ = fs::remove_dir(&dir);
            }
            Ok(purged)
        })
        .await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.blocking(false, move |root| {
            let path = audit_dir(root, &record.operation_id)?
                .join(format!("{}.json", safe_component(&record.id)?));
            write_json(&path, &record, true).map_err(|e| match e {
                WriteError::Exists => {
                    StorageError::Backend(format!("audit entry {} already written", record.id))
                }
                WriteError::Storage(e) => e,
            })
        })
        .await
    }

    async fn list_audit(&self, operation_id: &str) -> Result<Vec<AuditRecord>, StorageError> {
        let operation_id = operation_id.to_string();
        self.blocking(false, move |root| {
            let mut records: Vec<AuditRecord> =
                read_json_dir::<AuditRecord>(&audit_dir(root, &operation_id)?)?
                    .into_iter()
                    .map(|(_, record)| record)
                    .collect();
            records.sort_by(|a, b| {
                a.recorded_at
                    .cmp(&b.recorded_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(records)
        })
        .await
    }
}
