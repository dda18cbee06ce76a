pub mod keys;
pub mod middleware;
pub mod users;

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::db::Database;

/// Authenticated user identity attached to request extensions by auth middleware.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub user_id: String,
    pub name: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Well-formed credential that matches no identity.
    #[error("Invalid credential")]
    InvalidCredential,

    /// The credential store could not be consulted.
    #[error("Credential store error: {0}")]
    Store(String),
}

/// Verifies a bearer credential and yields a stable user identity.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<AuthUser, AuthError>> + Send + 'a>>;
}

/// Authenticates `sk-tg-` API keys stored as argon2 hashes in SQLite.
///
/// Verification is CPU-bound, so it runs on the blocking pool.
pub struct ApiKeyAuthenticator {
    db: Database,
}

impl ApiKeyAuthenticator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl Authenticator for ApiKeyAuthenticator {
    fn authenticate<'a>(
        &'a self,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<AuthUser, AuthError>> + Send + 'a>> {
        let db = self.db.clone();
        let credential = credential.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || users::validate_api_key(&db, &credential))
                .await
                .map_err(|e| AuthError::Store(format!("verification task failed: {e}")))?
        })
    }
}
