//! Backend selection, done once at startup.

use std::sync::Arc;

use tracksync_storage::{FileStorage, SqliteStorage, StorageError, SyncStorage};

use crate::config::{StorageBackend, StorageConfig};

pub(crate) fn open_storage(config: &StorageConfig) -> Result<Arc<dyn SyncStorage>, StorageError> {
    let path = config.resolved_path();
    let storage: Arc<dyn SyncStorage> = match config.backend {
        StorageBackend::Sqlite => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Backend(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            Arc::new(SqliteStorage::open(&path)?)
        }
        StorageBackend::File => Arc::new(FileStorage::open(&path)?),
    };
    tracing::info!(backend = ?config.backend, path = %path.display(), "storage opened");
    Ok(storage)
}
