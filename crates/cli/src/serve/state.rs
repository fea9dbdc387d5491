//! Application state shared across request handlers.

use std::sync::Arc;

use tracksync_engine::SyncEngine;

pub(crate) struct AppState {
    pub(crate) engine: Arc<SyncEngine>,
    /// Optional API key. None = no key required.
    pub(crate) api_key: Option<String>,
}
