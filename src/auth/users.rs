use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::keys::{self, GeneratedKey};
use crate::auth::{AuthError, AuthUser};
use crate::db::Database;
use crate::error::AppError;

/// Stored user record.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: String,
    pub created_at: String,
}

/// Stored API key metadata (never includes the hash).
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub id: String,
    pub user_id: String,
    pub key_prefix: String,
    pub label: String,
    pub created_at: String,
    pub last_used: Option<String>,
}

/// Result of creating a new API key: metadata plus the one-time plaintext.
#[derive(Debug)]
pub struct CreatedApiKey {
    pub info: ApiKeyInfo,
    pub plaintext: String,
}

/// Result of bootstrapping the first admin user.
#[derive(Debug)]
pub struct BootstrapResult {
    pub user: User,
    pub api_key_plaintext: String,
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<User, rusqlite::Error> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn row_to_key_info(row: &rusqlite::Row<'_>) -> Result<ApiKeyInfo, rusqlite::Error> {
    Ok(ApiKeyInfo {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key_prefix: row.get(2)?,
        label: row.get(3)?,
        created_at: row.get(4)?,
        last_used: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Create a new user with the given name and role.
///
/// Callers are responsible for provisioning the user's quota afterwards.
pub fn create_user(db: &Database, name: &str, role: &str) -> Result<User, AppError> {
    if role != "admin" && role != "member" {
        return Err(AppError::BadRequest(format!(
            "Invalid role '{role}': must be 'admin' or 'member'"
        )));
    }
    if name.trim().is_empty() {
        return Err(AppError::BadRequest("User name must not be empty".to_string()));
    }

    let id = Uuid::new_v4().to_string();
    let user = db
        .with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, role) VALUES (?1, ?2, ?3)",
                params![id, name, role],
            )?;
            conn.query_row(
                "SELECT id, name, role, created_at FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
        })
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::BadRequest(format!("User '{name}' already exists"))
            }
            other => AppError::from(other),
        })?;

    tracing::info!(user_id = %user.id, name = %user.name, role = %user.role, "User created");
    Ok(user)
}

pub fn list_users(db: &Database) -> Result<Vec<User>, AppError> {
    let users = db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT id, name, role, created_at FROM users ORDER BY created_at")?;
        let rows = stmt.query_map([], row_to_user)?;
        rows.collect::<Result<Vec<_>, _>>()
    })?;
    Ok(users)
}

pub fn get_user(db: &Database, user_id: &str) -> Result<User, AppError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT id, name, role, created_at FROM users WHERE id = ?1",
            params![user_id],
            row_to_user,
        )
    })
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            AppError::NotFound(format!("User '{user_id}' not found"))
        }
        other => AppError::Database(other.to_string()),
    })
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

pub fn create_api_key(
    db: &Database,
    user_id: &str,
    label: &str,
) -> Result<CreatedApiKey, AppError> {
    get_user(db, user_id)?;

    let GeneratedKey {
        plaintext,
        hash,
        prefix,
    } = keys::generate_api_key()
        .map_err(|e| AppError::Internal(format!("Failed to generate API key: {e}")))?;

    let key_id = Uuid::new_v4().to_string();

    let info = db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO api_keys (id, user_id, key_hash, key_prefix, label) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key_id, user_id, hash, prefix, label],
        )?;
        conn.query_row(
            "SELECT id, user_id, key_prefix, label, created_at, last_used FROM api_keys WHERE id = ?1",
            params![key_id],
            row_to_key_info,
        )
    })?;

    tracing::info!(
        key_id = %info.id,
        user_id = %user_id,
        prefix = %info.key_prefix,
        "API key created"
    );

    Ok(CreatedApiKey { info, plaintext })
}

/// List all API keys for a user (metadata only, no hashes).
pub fn list_api_keys(db: &Database, user_id: &str) -> Result<Vec<ApiKeyInfo>, AppError> {
    let keys = db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, key_prefix, label, created_at, last_used \
             FROM api_keys WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_key_info)?;
        rows.collect::<Result<Vec<_>, _>>()
    })?;
    Ok(keys)
}

pub fn revoke_api_key(db: &Database, key_id: &str) -> Result<(), AppError> {
    let deleted =
        db.with_conn(|conn| conn.execute("DELETE FROM api_keys WHERE id = ?1", params![key_id]))?;

    if deleted == 0 {
        return Err(AppError::NotFound(format!("API key '{key_id}' not found")));
    }

    tracing::info!(key_id = %key_id, "API key revoked");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a plaintext API key against the database.
///
/// Candidates are narrowed by display prefix before argon2 verification. On
/// success `last_used` is updated (best-effort). Blocking: call from the
/// blocking pool.
pub fn validate_api_key(db: &Database, plaintext: &str) -> Result<AuthUser, AuthError> {
    let Some(prefix) = keys::display_prefix(plaintext) else {
        return Err(AuthError::InvalidCredential);
    };

    let candidates = db
        .with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ak.id, ak.key_hash, u.id, u.name, u.role \
                 FROM api_keys ak \
                 JOIN users u ON ak.user_id = u.id \
                 WHERE ak.key_prefix = ?1",
            )?;
            let mapped = stmt.query_map(params![prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    AuthUser {
                        user_id: row.get(2)?,
                        name: row.get(3)?,
                        role: row.get(4)?,
                    },
                ))
            })?;
            mapped.collect::<Result<Vec<_>, _>>()
        })
        .map_err(|e| AuthError::Store(e.to_string()))?;

    for (key_id, key_hash, user) in candidates {
        let ok = keys::verify_key(plaintext, &key_hash)
            .map_err(|e| AuthError::Store(format!("Key verification error: {e}")))?;

        if ok {
            if let Err(e) = db.with_conn(|conn| {
                conn.execute(
                    "UPDATE api_keys SET last_used = datetime('now') WHERE id = ?1",
                    params![key_id],
                )
            }) {
                tracing::warn!(key_id = %key_id, error = %e, "Failed to update key last_used");
            }
            return Ok(user);
        }
    }

    Err(AuthError::InvalidCredential)
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// If no users exist, create a default admin user and generate an API key.
///
/// The plaintext key is printed to stdout so the operator can use it.
/// Returns `None` if users already exist.
pub fn bootstrap_admin(
    db: &Database,
    admin_name: &str,
) -> Result<Option<BootstrapResult>, AppError> {
    let user_count: i64 =
        db.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)))?;

    if user_count > 0 {
        return Ok(None);
    }

    tracing::info!("No users found -- bootstrapping default admin");

    let user = create_user(db, admin_name, "admin")?;
    let key = create_api_key(db, &user.id, "bootstrap")?;

    println!();
    println!("=========================================================");
    println!("  tollgate first-run bootstrap");
    println!("---------------------------------------------------------");
    println!("  Admin user : {}", user.name);
    println!("  API key    : {}", key.plaintext);
    println!("---------------------------------------------------------");
    println!("  Save this key now -- it will not be shown again.");
    println!("=========================================================");
    println!();

    Ok(Some(BootstrapResult {
        user,
        api_key_plaintext: key.plaintext,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get_user() {
        let db = test_db();
        let user = create_user(&db, "alice", "member").unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.role, "member");

        let fetched = get_user(&db, &user.id).unwrap();
        assert_eq!(fetched.id, user.id);
    }

    #[test]
    fn test_create_user_invalid_role() {
        let db = test_db();
        assert!(create_user(&db, "bob", "superuser").is_err());
    }

    #[test]
    fn test_create_user_duplicate_name() {
        let db = test_db();
        create_user(&db, "alice", "member").unwrap();
        let err = create_user(&db, "alice", "admin").unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_list_users() {
        let db = test_db();
        create_user(&db, "alice", "admin").unwrap();
        create_user(&db, "bob", "member").unwrap();
        assert_eq!(list_users(&db).unwrap().len(), 2);
    }

    #[test]
    fn test_create_and_list_api_keys() {
        let db = test_db();
        let user = create_user(&db, "alice", "admin").unwrap();
        let created = create_api_key(&db, &user.id, "test key").unwrap();

        assert!(created.plaintext.starts_with("sk-tg-"));
        assert_eq!(created.info.label, "test key");

        let keys = list_api_keys(&db, &user.id).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, created.info.id);
    }

    #[test]
    fn test_create_api_key_user_not_found() {
        let db = test_db();
        assert!(create_api_key(&db, "nonexistent", "test").is_err());
    }

    #[test]
    fn test_revoke_api_key() {
        let db = test_db();
        let user = create_user(&db, "alice", "admin").unwrap();
        let created = create_api_key(&db, &user.id, "revoke me").unwrap();
        revoke_api_key(&db, &created.info.id).unwrap();

        assert!(list_api_keys(&db, &user.id).unwrap().is_empty());
        assert!(matches!(
            validate_api_key(&db, &created.plaintext),
            Err(AuthError::InvalidCredential)
        ));
    }

    #[test]
    fn test_revoke_api_key_not_found() {
        let db = test_db();
        assert!(revoke_api_key(&db, "nonexistent").is_err());
    }

    #[test]
    fn test_validate_api_key_success() {
        let db = test_db();
        let user = create_user(&db, "alice", "admin").unwrap();
        let created = create_api_key(&db, &user.id, "auth test").unwrap();

        let auth_user = validate_api_key(&db, &created.plaintext).unwrap();
        assert_eq!(auth_user.user_id, user.id);
        assert_eq!(auth_user.name, "alice");
        assert!(auth_user.is_admin());
    }

    #[test]
    fn test_validate_api_key_invalid() {
        let db = test_db();
        create_user(&db, "alice", "admin").unwrap();

        assert!(matches!(
            validate_api_key(&db, "sk-tg-invalid00000000000000000000000"),
            Err(AuthError::InvalidCredential)
        ));
        assert!(matches!(
            validate_api_key(&db, "not-a-key"),
            Err(AuthError::InvalidCredential)
        ));
    }

    #[test]
    fn test_validate_updates_last_used() {
        let db = test_db();
        let user = create_user(&db, "alice", "admin").unwrap();
        let created = create_api_key(&db, &user.id, "timestamp test").unwrap();

        assert!(list_api_keys(&db, &user.id).unwrap()[0].last_used.is_none());
        validate_api_key(&db, &created.plaintext).unwrap();
        assert!(list_api_keys(&db, &user.id).unwrap()[0].last_used.is_some());
    }

    #[test]
    fn test_bootstrap_admin_creates_user_and_key() {
        let db = test_db();
        let boot = bootstrap_admin(&db, "admin").unwrap().unwrap();
        assert_eq!(boot.user.name, "admin");
        assert_eq!(boot.user.role, "admin");
        assert!(boot.api_key_plaintext.starts_with("sk-tg-"));

        let auth_user = validate_api_key(&db, &boot.api_key_plaintext).unwrap();
        assert_eq!(auth_user.name, "admin");
    }

    #[test]
    fn test_bootstrap_admin_skips_if_users_exist() {
        let db = test_db();
        create_user(&db, "existing", "member").unwrap();
        assert!(bootstrap_admin(&db, "admin").unwrap().is_none());
    }
}
