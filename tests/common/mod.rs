#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::MockServer;

use tollgate::AppState;
use tollgate::api::build_router;
use tollgate::auth::users::{create_api_key, create_user};
use tollgate::config::Config;
use tollgate::db::Database;
use tollgate::providers::{GeminiText, OpenAiImages, ProviderRegistry};
use tollgate::quota::{self, QuotaLedger, QuotaLimits, SqliteLedger, spawn_audit_logger};

use std::sync::Arc;

pub const OPENAI_KEY: &str = "sk-upstream-openai";
pub const GEMINI_KEY: &str = "upstream-gemini";

/// A full router over a file-backed database, with both providers pointed
/// at mock upstreams.
pub struct Harness {
    pub app: Router,
    pub state: AppState,
    pub openai: MockServer,
    pub gemini: MockServer,
    _dir: TempDir,
}

pub struct Caller {
    pub user_id: String,
    pub key: String,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    pub fn error_code(&self) -> &str {
        self.body["error"]["code"].as_str().unwrap_or_default()
    }
}

impl Harness {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let openai = MockServer::start().await;
        let gemini = MockServer::start().await;

        let mut config = Config::default();
        config.database.path = dir.path().join("tollgate.db");
        config.providers.openai_images.base_url = openai.uri();
        config.providers.openai_images.api_key = Some(OPENAI_KEY.to_string());
        config.providers.gemini.base_url = gemini.uri();
        config.providers.gemini.api_key = Some(GEMINI_KEY.to_string());

        let db = Database::open(&config.database.path).unwrap();
        let ledger = Arc::new(SqliteLedger::new(db.clone()));

        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(
            OpenAiImages::new(&config.providers.openai_images).unwrap(),
        ));
        providers.register(Arc::new(GeminiText::new(&config.providers.gemini).unwrap()));

        let (audit_tx, audit_rx) = tokio::sync::mpsc::unbounded_channel();
        spawn_audit_logger(db.clone(), audit_rx);

        let state = AppState::new(config, db, ledger, providers, audit_tx);
        Self {
            app: build_router(state.clone()),
            state,
            openai,
            gemini,
            _dir: dir,
        }
    }

    /// Create a user with a key and a provisioned quota.
    pub fn caller(&self, role: &str, text_unit_limit: u64, image_unit_limit: f64) -> Caller {
        let name = format!("{role}-{}", uuid::Uuid::new_v4());
        let user = create_user(&self.state.db, &name, role).unwrap();
        let key = create_api_key(&self.state.db, &user.id, "test").unwrap();
        quota::provision_user(
            self.state.ledger.as_ref(),
            &user.id,
            QuotaLimits {
                text_unit_limit,
                image_unit_limit,
            },
        )
        .unwrap();
        Caller {
            user_id: user.id,
            key: key.plaintext,
        }
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let resp = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Reply {
            status,
            headers,
            body,
        }
    }

    pub async fn post(&self, uri: &str, key: &str, body: Value) -> Reply {
        self.send(Method::POST, uri, Some(key), Some(body)).await
    }

    pub fn image_consumed(&self, user_id: &str) -> f64 {
        self.state.ledger.get(user_id).unwrap().image_units_consumed
    }

    pub fn text_consumed(&self, user_id: &str) -> u64 {
        self.state.ledger.get(user_id).unwrap().text_units_consumed
    }
}
