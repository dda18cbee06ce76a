use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;

/// Axum middleware that extracts a Bearer token from the Authorization header,
/// verifies it with the configured [`Authenticator`](crate::auth::Authenticator),
/// and injects an `AuthUser` into request extensions.
///
/// A missing or malformed header is `401`; a well-formed credential that
/// matches nothing is `403 invalid_api_key`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(&request)?;
    let auth_user = state.authenticator.authenticate(&token).await?;

    tracing::debug!(
        user_id = %auth_user.user_id,
        name = %auth_user.name,
        role = %auth_user.role,
        "Authenticated request"
    );

    request.extensions_mut().insert(auth_user);
    Ok(next.run(request).await)
}

/// Axum middleware that requires the authenticated user to have the admin role.
///
/// Must be applied _after_ `require_auth` so that `AuthUser` is present in
/// request extensions.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let auth_user = request.extensions().get::<AuthUser>().ok_or_else(|| {
        AppError::Internal("AuthUser missing from extensions -- is require_auth applied?".to_string())
    })?;

    if !auth_user.is_admin() {
        return Err(AppError::Forbidden(format!(
            "Admin role required, but user '{}' has role '{}'",
            auth_user.name, auth_user.role
        )));
    }

    Ok(next.run(request).await)
}

/// Extract the Bearer token from the Authorization header.
fn extract_bearer_token(request: &Request) -> Result<String, AppError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    let value = header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid Authorization header encoding".to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            AppError::Unauthorized("Authorization header must use Bearer scheme".to_string())
        })?
        .trim();

    if token.is_empty() {
        return Err(AppError::Unauthorized("Empty Bearer token".to_string()));
    }

    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode, header};
    use axum::middleware;
    use axum::routing::get;
    use tower::ServiceExt;

    use crate::auth::users::{create_api_key, create_user};
    use crate::test_support::test_state;

    async fn whoami(request: Request) -> String {
        let user = request.extensions().get::<AuthUser>().unwrap();
        user.name.clone()
    }

    async fn admin_only(request: Request) -> String {
        let user = request.extensions().get::<AuthUser>().unwrap();
        format!("admin: {}", user.name)
    }

    fn auth_router(state: AppState) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    fn admin_router(state: AppState) -> Router {
        Router::new()
            .route("/admin", get(admin_only))
            .layer(middleware::from_fn(require_admin))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    async fn send(app: Router, auth: Option<&str>, uri: &str) -> StatusCode {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let resp = app
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        resp.status()
    }

    // -----------------------------------------------------------------------
    // extract_bearer_token
    // -----------------------------------------------------------------------

    #[test]
    fn test_extract_bearer_token_valid() {
        let req = HttpRequest::builder()
            .header(header::AUTHORIZATION, "Bearer sk-tg-abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req).unwrap(), "sk-tg-abc123");
    }

    #[test]
    fn test_extract_bearer_token_trims_whitespace() {
        let req = HttpRequest::builder()
            .header(header::AUTHORIZATION, "Bearer   sk-tg-abc123   ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req).unwrap(), "sk-tg-abc123");
    }

    #[test]
    fn test_extract_bearer_token_rejections() {
        for value in [None, Some("Basic dXNlcjpwYXNz"), Some("Bearer ")] {
            let mut builder = HttpRequest::builder();
            if let Some(v) = value {
                builder = builder.header(header::AUTHORIZATION, v);
            }
            let req = builder.body(Body::empty()).unwrap();
            assert!(matches!(
                extract_bearer_token(&req),
                Err(AppError::Unauthorized(_))
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Full middleware stack
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_auth_header() {
        let state = test_state();
        assert_eq!(
            send(auth_router(state), None, "/whoami").await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_invalid_bearer_scheme() {
        let state = test_state();
        assert_eq!(
            send(auth_router(state), Some("Basic dXNlcjpwYXNz"), "/whoami").await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_invalid_api_key_is_forbidden() {
        let state = test_state();
        assert_eq!(
            send(
                auth_router(state),
                Some("Bearer sk-tg-invalid00000000000000000000000"),
                "/whoami"
            )
            .await,
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn test_valid_auth() {
        let state = test_state();
        let user = create_user(&state.db, "alice", "member").unwrap();
        let key = create_api_key(&state.db, &user.id, "test").unwrap();

        let req = HttpRequest::builder()
            .uri("/whoami")
            .header(header::AUTHORIZATION, format!("Bearer {}", key.plaintext))
            .body(Body::empty())
            .unwrap();

        let resp = auth_router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_admin_middleware_allows_admin() {
        let state = test_state();
        let user = create_user(&state.db, "admin", "admin").unwrap();
        let key = create_api_key(&state.db, &user.id, "admin key").unwrap();
        let bearer = format!("Bearer {}", key.plaintext);

        assert_eq!(
            send(admin_router(state), Some(&bearer), "/admin").await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_admin_middleware_rejects_member() {
        let state = test_state();
        let user = create_user(&state.db, "bob", "member").unwrap();
        let key = create_api_key(&state.db, &user.id, "member key").unwrap();
        let bearer = format!("Bearer {}", key.plaintext);

        assert_eq!(
            send(admin_router(state), Some(&bearer), "/admin").await,
            StatusCode::FORBIDDEN
        );
    }
}
