use axum::Extension;
use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::quota::{self, UserQuota};

/// GET /v1/quota
///
/// The caller's own counters and limits.
pub async fn my_quota(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<UserQuota>, AppError> {
    let user_id = user.user_id.clone();
    let quota = quota::blocking(&state.ledger, move |ledger| ledger.get(&user_id)).await?;
    Ok(Json(quota))
}
