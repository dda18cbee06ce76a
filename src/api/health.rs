use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;
use crate::providers::registry::ProviderInfo;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub ledger: String,
    pub providers: Vec<ProviderInfo>,
}

/// GET /health
///
/// Liveness plus the registered adapters. No authentication required.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger: state.ledger.backend().to_string(),
        providers: state.providers.list(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::ProviderKind;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            ledger: "sqlite".to_string(),
            providers: vec![ProviderInfo {
                id: "gemini".to_string(),
                kind: ProviderKind::Text,
            }],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["ledger"], "sqlite");
        assert_eq!(json["providers"][0]["id"], "gemini");
    }

    #[tokio::test]
    async fn test_health_check_without_providers() {
        let state = crate::test_support::test_state();
        let Json(body) = health_check(State(state)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.ledger, "memory");
        assert!(body.providers.is_empty());
    }
}
