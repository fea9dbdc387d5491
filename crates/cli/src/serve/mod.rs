//! `tracksync serve` -- HTTP JSON API and WebSocket notification server.
//!
//! Every route except `/health` requires `X-Owner-Id`, set by the upstream
//! auth proxy. When an API key is configured the request must also carry
//! `Authorization: Bearer <key>` or `X-API-Key: <key>`.
//!
//! Endpoints:
//! - GET    /health                        - Server status (exempt from auth)
//! - POST   /operations                    - Create an operation (202)
//! - GET    /operations?limit=N            - The caller's operations, newest first
//! - GET    /operations/{id}               - One operation
//! - GET    /operations/{id}/rollback      - Rollback eligibility
//! - POST   /operations/{id}/rollback      - Request a rollback (202 / 409)
//! - GET    /operations/{id}/audit         - Audit trail
//! - GET    /references/{system}/{kind}    - Cached reference data
//! - DELETE /references/{system}/{kind}    - Drop the cached entry
//! - GET    /ws                            - Notification stream (WebSocket)
//!
//! All HTTP responses use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;
mod ws;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware as axum_middleware, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracksync_engine::{HttpTracker, SyncEngine};

use self::handlers::{
    handle_audit, handle_create_operation, handle_get_operation, handle_get_reference,
    handle_health, handle_invalidate_reference, handle_list_operations, handle_not_found,
    handle_request_rollback, handle_rollback_status,
};
use self::middleware::auth_middleware;
use self::state::AppState;
use self::ws::handle_ws;
use crate::config::AppConfig;
use crate::storage::open_storage;

/// Maximum request body size: 1 MB.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Build the router over an already-started engine.
pub(crate) fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/operations",
            get(handle_list_operations).post(handle_create_operation),
        )
        .route("/operations/{id}", get(handle_get_operation))
        .route(
            "/operations/{id}/rollback",
            get(handle_rollback_status).post(handle_request_rollback),
        )
        .route("/operations/{id}/audit", get(handle_audit))
        .route(
            "/references/{system}/{kind}",
            get(handle_get_reference).delete(handle_invalidate_reference),
        )
        .route("/ws", get(handle_ws))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Open storage, start the engine, and serve until Ctrl+C.
pub(crate) async fn start_server(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(&config.storage)?;
    let tracker = Arc::new(HttpTracker::new(config.trackers.clone()));
    let systems: Vec<&str> = tracker.systems().collect();
    tracing::info!(?systems, "trackers configured");

    let engine = SyncEngine::start(storage, tracker, config.engine.clone())?;

    let api_key = config.server.api_key.clone().filter(|k| !k.is_empty());
    if api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        api_key,
    });

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("tracksync listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    tracing::info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
