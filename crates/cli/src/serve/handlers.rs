//! HTTP route handlers: health, operations, rollback, audit, references.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracksync_engine::{EngineError, OperationId, OperationKind, RollbackEligibility};

use super::json_error;
use super::middleware::Owner;
use super::state::AppState;

/// An engine error rendered as an HTTP response.
pub(crate) struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, body) = match &self.0 {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            EngineError::Forbidden(_) => (StatusCode::FORBIDDEN, json!({ "error": message })),
            EngineError::InvalidTransition { from, to, .. } => (
                StatusCode::CONFLICT,
                json!({ "error": message, "from": from, "to": to }),
            ),
            EngineError::Rejected(rejection) => (
                StatusCode::CONFLICT,
                json!({ "error": message, "reason": rejection.reason() }),
            ),
            EngineError::PartialFailure {
                reverted,
                unreverted,
            } => (
                StatusCode::CONFLICT,
                json!({ "error": message, "reverted": reverted, "unreverted": unreverted }),
            ),
            EngineError::Storage(_) => {
                tracing::error!(error = %message, "storage failure serving request");
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": message }))
            }
            EngineError::Collaborator(_) => (StatusCode::BAD_GATEWAY, json!({ "error": message })),
            EngineError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, json!({ "error": message })),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_id(raw: &str) -> Result<OperationId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(EngineError::Validation(format!("invalid operation id '{raw}'"))))
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

#[derive(Deserialize)]
pub(crate) struct CreateRequest {
    kind: OperationKind,
    parameters: serde_json::Value,
}

/// POST /operations
pub(crate) async fn handle_create_operation(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Json(request): Json<CreateRequest>,
) -> Result<Response, ApiError> {
    let operation = state
        .engine
        .create_operation(&owner, request.kind, request.parameters)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(operation.to_json())).into_response())
}

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    limit: Option<i64>,
}

/// GET /operations?limit=N
pub(crate) async fn handle_list_operations(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let operations = state.engine.list_operations(&owner, query.limit).await?;
    let operations: Vec<_> = operations.iter().map(|op| op.to_json()).collect();
    Ok((StatusCode::OK, Json(json!({ "operations": operations }))).into_response())
}

/// GET /operations/{id}
pub(crate) async fn handle_get_operation(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let operation = state.engine.get_operation(&owner, &id).await?;
    Ok((StatusCode::OK, Json(operation.to_json())).into_response())
}

/// GET /operations/{id}/rollback
pub(crate) async fn handle_rollback_status(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let eligibility = state.engine.rollback_status(&owner, &id).await?;
    let snapshots = match eligibility {
        RollbackEligibility::Eligible { snapshots } => Some(snapshots),
        RollbackEligibility::Ineligible(_) => None,
    };
    let body = json!({
        "operation_id": id.to_string(),
        "eligible": eligibility.is_eligible(),
        "reason": eligibility.reason(),
        "snapshots": snapshots,
    });
    Ok((StatusCode::OK, Json(body)).into_response())
}

/// POST /operations/{id}/rollback
pub(crate) async fn handle_request_rollback(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let rollback = state.engine.request_rollback(&owner, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(rollback.to_json())).into_response())
}

/// GET /operations/{id}/audit
pub(crate) async fn handle_audit(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let entries = state.engine.audit_trail(&owner, &id).await?;
    Ok((StatusCode::OK, Json(json!({ "entries": entries }))).into_response())
}

/// GET /references/{system}/{kind}
pub(crate) async fn handle_get_reference(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path((system, kind)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let data = state.engine.reference(&owner, &system, &kind).await?;
    let body = json!({ "system": system, "kind": kind, "data": data });
    Ok((StatusCode::OK, Json(body)).into_response())
}

/// DELETE /references/{system}/{kind}
pub(crate) async fn handle_invalidate_reference(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path((system, kind)): Path<(String, String)>,
) -> impl IntoResponse {
    let removed = state.engine.invalidate_reference(&owner, &system, &kind);
    (StatusCode::OK, Json(json!({ "invalidated": removed })))
}
