//! HTTP middleware and extractors: API key authentication, caller identity.

use std::sync::Arc;

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracksync_engine::OwnerId;

use super::json_error;
use super::state::AppState;

/// Header carrying the caller's identity, set by the upstream auth proxy.
pub(crate) const OWNER_HEADER: &str = "x-owner-id";

/// API key authentication middleware.
///
/// If an API key is configured, all requests (except /health) must include
/// either `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let expected_key = match &state.api_key {
        Some(k) => k,
        None => return next.run(request).await,
    };

    // /health stays open for load balancer checks.
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));
    let api_key_header = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match bearer.or(api_key_header) {
        Some(key) if key == expected_key => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "request with invalid API key");
            json_error(StatusCode::FORBIDDEN, "invalid API key")
        }
        None => json_error(StatusCode::UNAUTHORIZED, "authentication required"),
    }
}

/// The authenticated caller, from the `X-Owner-Id` header.
pub(crate) struct Owner(pub(crate) OwnerId);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| OwnerId::new(v))
            .map(Owner)
            .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "missing X-Owner-Id header"))
    }
}
