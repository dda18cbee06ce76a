//! OpenAI image generation adapter.
//!
//! Forwards validated image parameters to `POST /v1/images/generations` and
//! relays the JSON body back unchanged. The endpoint does not report usage,
//! so the upfront price stands.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::OpenAiImagesConfig;
use crate::providers::types::{PricedRequest, ProviderKind, ProviderParams, ProviderResponse};
use crate::providers::{CompletionService, ProviderError, api_error};

/// Wire body for the generations endpoint.
#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    response_format: &'a str,
}

pub struct OpenAiImages {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiImages {
    pub fn new(config: &OpenAiImagesConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn generate(&self, request: &PricedRequest) -> Result<ProviderResponse, ProviderError> {
        let ProviderParams::Image(params) = &request.params else {
            return Err(ProviderError::InvalidRequest(
                "image provider received a non-image request".to_string(),
            ));
        };

        let body = GenerationRequest {
            model: &params.model,
            prompt: &params.prompt,
            n: params.n,
            size: &params.size,
            response_format: &params.response_format,
        };

        let url = format!("{}/v1/images/generations", self.base_url);
        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        debug!(request_id = %request.request_id, model = %params.model, n = params.n, "Sending image request");
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let payload = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(ProviderResponse {
            payload,
            usage: None,
        })
    }
}

impl CompletionService for OpenAiImages {
    fn id(&self) -> &str {
        "openai_images"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Image
    }

    fn model(&self, params: &ProviderParams) -> String {
        match params {
            ProviderParams::Image(image) => image.model.clone(),
            ProviderParams::Text(_) => String::new(),
        }
    }

    fn complete<'a>(
        &'a self,
        request: &'a PricedRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, ProviderError>> + Send + 'a>> {
        Box::pin(self.generate(request))
    }
}
