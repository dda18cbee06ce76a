use axum::Extension;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use serde_json::Value;
use uuid::Uuid;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::gateway::{self, ProxyOutcome, REQUEST_ID_HEADER};
use crate::providers::types::ProviderKind;

/// POST /proxy/image
///
/// Image generation, priced up front from model, size and count.
pub async fn proxy_image(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ProxyOutcome, AppError> {
    proxy(state, user, headers, body, ProviderKind::Image).await
}

/// POST /proxy/text
///
/// Text generation. The body is relayed as-is and metered from the
/// provider's usage report.
pub async fn proxy_text(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ProxyOutcome, AppError> {
    proxy(state, user, headers, body, ProviderKind::Text).await
}

async fn proxy(
    state: AppState,
    user: AuthUser,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
    kind: ProviderKind,
) -> Result<ProxyOutcome, AppError> {
    let Json(body) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let request_id = request_id(&headers);

    tracing::info!(
        request_id = %request_id,
        user_id = %user.user_id,
        kind = %kind,
        "Proxy request"
    );

    gateway::process(&state, &user, kind, body, request_id).await
}

/// The id set by the request-id layer, or a fresh one when running without it.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
