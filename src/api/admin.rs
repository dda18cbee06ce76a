use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::users;
use crate::error::AppError;
use crate::quota::{self, QuotaLimits, UserQuota};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    /// Overrides for the configured default limits.
    pub text_unit_limit: Option<u64>,
    pub image_unit_limit: Option<f64>,
}

fn default_role() -> String {
    "member".to_string()
}

#[derive(Debug, Serialize)]
pub struct CreatedUserResponse {
    pub user: users::User,
    pub api_key: CreatedApiKeyResponse,
    pub quota: UserQuota,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedApiKeyResponse {
    pub id: String,
    pub user_id: String,
    pub key_prefix: String,
    pub label: String,
    pub created_at: String,
    /// The full plaintext key. Shown exactly once.
    pub plaintext: String,
}

impl From<users::CreatedApiKey> for CreatedApiKeyResponse {
    fn from(created: users::CreatedApiKey) -> Self {
        Self {
            id: created.info.id,
            user_id: created.info.user_id,
            key_prefix: created.info.key_prefix,
            label: created.info.label,
            created_at: created.info.created_at,
            plaintext: created.plaintext,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetQuotaRequest {
    pub text_unit_limit: Option<u64>,
    pub image_unit_limit: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub user_id: Option<String>,
    pub provider: Option<String>,
    pub status: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}
fn default_per_page() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct UsageEntry {
    pub id: String,
    pub user_id: String,
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub unit_kind: String,
    pub units: f64,
    pub latency_ms: i64,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub data: Vec<UsageEntry>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_image_limit(limit: f64) -> Result<f64, AppError> {
    if !limit.is_finite() || limit < 0.0 {
        return Err(AppError::BadRequest(format!(
            "image_unit_limit must be a non-negative number, got {limit}"
        )));
    }
    Ok(limit)
}

fn merge_limits(
    base: QuotaLimits,
    text_unit_limit: Option<u64>,
    image_unit_limit: Option<f64>,
) -> Result<QuotaLimits, AppError> {
    Ok(QuotaLimits {
        text_unit_limit: text_unit_limit.unwrap_or(base.text_unit_limit),
        image_unit_limit: validate_image_limit(image_unit_limit.unwrap_or(base.image_unit_limit))?,
    })
}

/// Rows to skip for a 1-based page. Computed in `i64`, which holds any
/// `u32` page times `u32` page size.
fn page_offset(page: u32, per_page: u32) -> i64 {
    i64::from(page.saturating_sub(1)) * i64::from(per_page)
}

// ---------------------------------------------------------------------------
// User management
// ---------------------------------------------------------------------------

/// POST /admin/users
///
/// Creates the user, issues a first API key, and provisions the quota.
pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<CreatedUserResponse>, AppError> {
    let limits = merge_limits(
        state.config.quota.default_limits(),
        body.text_unit_limit,
        body.image_unit_limit,
    )?;

    let user = users::create_user(&state.db, &body.name, &body.role)?;
    let key = users::create_api_key(&state.db, &user.id, "default")?;

    let user_id = user.id.clone();
    let mut quota = quota::blocking(&state.ledger, move |ledger| {
        quota::provision_user(ledger, &user_id, limits)
    })
    .await?;

    // Provisioning keeps an existing record, so apply explicit limits on top.
    if quota.text_unit_limit != limits.text_unit_limit
        || quota.image_unit_limit != limits.image_unit_limit
    {
        let user_id = user.id.clone();
        quota = quota::blocking(&state.ledger, move |ledger| ledger.set_limits(&user_id, limits))
            .await?;
    }

    Ok(Json(CreatedUserResponse {
        user,
        api_key: key.into(),
        quota,
    }))
}

/// GET /admin/users
pub async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<users::User>>, AppError> {
    let all = users::list_users(&state.db)?;
    Ok(Json(all))
}

// ---------------------------------------------------------------------------
// API key management
// ---------------------------------------------------------------------------

/// POST /admin/users/:id/keys
pub async fn create_api_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<Json<CreatedApiKeyResponse>, AppError> {
    users::get_user(&state.db, &id)?;
    let created = users::create_api_key(&state.db, &id, &body.label)?;
    Ok(Json(created.into()))
}

/// GET /admin/users/:id/keys
pub async fn list_api_keys(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<users::ApiKeyInfo>>, AppError> {
    let keys = users::list_api_keys(&state.db, &id)?;
    Ok(Json(keys))
}

/// DELETE /admin/keys/:id
pub async fn revoke_api_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, AppError> {
    users::revoke_api_key(&state.db, &id)?;
    Ok(Json(DeletedResponse { deleted: true }))
}

// ---------------------------------------------------------------------------
// Quota management
// ---------------------------------------------------------------------------

/// GET /admin/quotas/:user_id
pub async fn get_quota(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserQuota>, AppError> {
    let quota = quota::blocking(&state.ledger, move |ledger| ledger.get(&user_id)).await?;
    Ok(Json(quota))
}

/// PUT /admin/quotas/:user_id
///
/// Omitted fields keep their current value. Consumption is left untouched.
pub async fn set_quota(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<SetQuotaRequest>,
) -> Result<Json<UserQuota>, AppError> {
    let current = {
        let user_id = user_id.clone();
        quota::blocking(&state.ledger, move |ledger| ledger.get(&user_id)).await?
    };
    let limits = merge_limits(
        QuotaLimits {
            text_unit_limit: current.text_unit_limit,
            image_unit_limit: current.image_unit_limit,
        },
        body.text_unit_limit,
        body.image_unit_limit,
    )?;

    let quota = quota::blocking(&state.ledger, move |ledger| {
        ledger.set_limits(&user_id, limits)
    })
    .await?;

    tracing::info!(
        user_id = %quota.user_id,
        text_unit_limit = quota.text_unit_limit,
        image_unit_limit = quota.image_unit_limit,
        "Quota limits updated"
    );
    Ok(Json(quota))
}

// ---------------------------------------------------------------------------
// Usage queries
// ---------------------------------------------------------------------------

/// GET /admin/usage
pub async fn query_usage(
    State(state): State<AppState>,
    Query(params): Query<UsageQuery>,
) -> Result<Json<UsageResponse>, AppError> {
    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 500);
    let offset = page_offset(page, per_page);

    // Build query dynamically based on provided filters.
    let mut where_clauses: Vec<String> = Vec::new();
    let mut bind_values: Vec<String> = Vec::new();

    for (column, op, value) in [
        ("user_id", "=", &params.user_id),
        ("provider", "=", &params.provider),
        ("status", "=", &params.status),
        ("created_at", ">=", &params.from),
        ("created_at", "<=", &params.to),
    ] {
        if let Some(value) = value {
            bind_values.push(value.clone());
            where_clauses.push(format!("{column} {op} ?{}", bind_values.len()));
        }
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM usage_log {where_sql}");
    let data_sql = format!(
        "SELECT id, user_id, request_id, provider, model, unit_kind, units, \
         latency_ms, status, created_at \
         FROM usage_log {where_sql} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
        bind_values.len() + 1,
        bind_values.len() + 2,
    );

    let (data, total) = state.db.with_conn(|conn| {
        let total: i64 = {
            let mut stmt = conn.prepare(&count_sql)?;
            let p: Vec<&dyn rusqlite::ToSql> =
                bind_values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            stmt.query_row(p.as_slice(), |row| row.get(0))?
        };

        let limit = i64::from(per_page);
        let mut p: Vec<&dyn rusqlite::ToSql> =
            bind_values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        p.push(&limit);
        p.push(&offset);

        let mut stmt = conn.prepare(&data_sql)?;
        let rows = stmt.query_map(p.as_slice(), |row| {
            Ok(UsageEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                request_id: row.get(2)?,
                provider: row.get(3)?,
                model: row.get(4)?,
                unit_kind: row.get(5)?,
                units: row.get(6)?,
                latency_ms: row.get(7)?,
                status: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;

        let data: Vec<UsageEntry> = rows.collect::<Result<Vec<_>, _>>()?;
        Ok((data, total))
    })?;

    Ok(Json(UsageResponse {
        data,
        page,
        per_page,
        total,
    }))
}
