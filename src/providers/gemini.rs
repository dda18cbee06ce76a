//! Gemini `generateContent` adapter.
//!
//! The caller's body is forwarded unmodified to the configured model and the
//! upstream JSON is relayed back. Usage comes from
//! `usageMetadata.totalTokenCount`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::GeminiConfig;
use crate::providers::types::{PricedRequest, ProviderKind, ProviderParams, ProviderResponse};
use crate::providers::{CompletionService, ProviderError, api_error};
use crate::quota::Units;

pub struct GeminiText {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl GeminiText {
    pub fn new(config: &GeminiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn generate(&self, request: &PricedRequest) -> Result<ProviderResponse, ProviderError> {
        let ProviderParams::Text(body) = &request.params else {
            return Err(ProviderError::InvalidRequest(
                "text provider received a non-text request".to_string(),
            ));
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let mut req = self.client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.query(&[("key", key)]);
        }

        debug!(request_id = %request.request_id, model = %self.model, "Sending generateContent request");
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let payload = resp
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let usage = total_token_count(&payload).map(Units::Text);

        Ok(ProviderResponse { payload, usage })
    }
}

fn total_token_count(payload: &Value) -> Option<u64> {
    payload
        .get("usageMetadata")
        .and_then(|m| m.get("totalTokenCount"))
        .and_then(Value::as_u64)
}

impl CompletionService for GeminiText {
    fn id(&self) -> &str {
        "gemini"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Text
    }

    fn model(&self, _params: &ProviderParams) -> String {
        self.model.clone()
    }

    fn complete<'a>(
        &'a self,
        request: &'a PricedRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, ProviderError>> + Send + 'a>> {
        Box::pin(self.generate(request))
    }
}
