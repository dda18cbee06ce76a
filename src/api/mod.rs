pub mod admin;
pub mod health;
pub mod proxy;
pub mod quota;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

use crate::AppState;
use crate::auth::middleware::{require_admin, require_auth};

/// Build the full router with all endpoint groups and their auth layers.
///
/// Route layout:
/// ```text
/// /health                        GET      (no auth)
/// /proxy/image                   POST     (auth required)
/// /proxy/text                    POST     (auth required)
/// /v1/quota                      GET      (auth required)
/// /admin/users                   POST/GET (admin)
/// /admin/users/:id/keys          POST/GET (admin)
/// /admin/keys/:id                DELETE   (admin)
/// /admin/quotas/:user_id         GET/PUT  (admin)
/// /admin/usage                   GET      (admin)
/// ```
///
/// Auth is attached with `route_layer`, so a wrong method is answered with
/// `405` before any credential is checked.
pub fn build_router(state: AppState) -> Router {
    let auth = middleware::from_fn_with_state(state.clone(), require_auth);

    let admin_routes = Router::new()
        .route("/users", post(admin::create_user).get(admin::list_users))
        .route(
            "/users/{id}/keys",
            post(admin::create_api_key).get(admin::list_api_keys),
        )
        .route("/keys/{id}", delete(admin::revoke_api_key))
        .route(
            "/quotas/{user_id}",
            get(admin::get_quota).put(admin::set_quota),
        )
        .route("/usage", get(admin::query_usage))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(auth.clone());

    let user_routes = Router::new()
        .route("/proxy/image", post(proxy::proxy_image))
        .route("/proxy/text", post(proxy::proxy_text))
        .route("/v1/quota", get(quota::my_quota))
        .route_layer(auth);

    Router::new()
        .route("/health", get(health::health_check))
        .merge(user_routes)
        .nest("/admin", admin_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use crate::auth::users::{create_api_key, create_user};
    use crate::test_support::test_state;

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_on_proxy_route_is_method_not_allowed() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::get("/proxy/image").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_member_cannot_reach_admin_routes() {
        let state = test_state();
        let user = create_user(&state.db, "bob", "member").unwrap();
        let key = create_api_key(&state.db, &user.id, "k").unwrap();

        let resp = build_router(state)
            .oneshot(
                Request::get("/admin/users")
                    .header(header::AUTHORIZATION, format!("Bearer {}", key.plaintext))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
