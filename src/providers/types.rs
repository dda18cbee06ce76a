//! Request and response types shared by the gateway and the adapters.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::quota::{Cost, Units};

/// Which proxy route a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Image,
    Text,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_image_model() -> String {
    "dall-e-2".to_string()
}

fn default_n() -> u32 {
    1
}

fn default_size() -> String {
    "1024x1024".to_string()
}

fn default_response_format() -> String {
    "b64_json".to_string()
}

/// Body of `POST /proxy/image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(
        rename = "responseFormat",
        alias = "response_format",
        default = "default_response_format"
    )]
    pub response_format: String,
}

/// Validated parameters for one provider kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderParams {
    Image(ImageParams),
    /// Text bodies are relayed to the provider unmodified.
    Text(Value),
}

impl ProviderParams {
    /// Interpret a raw JSON body for the given route.
    pub fn from_body(kind: ProviderKind, body: Value) -> Result<Self, serde_json::Error> {
        match kind {
            ProviderKind::Image => serde_json::from_value(body).map(Self::Image),
            ProviderKind::Text => Ok(Self::Text(body)),
        }
    }
}

/// A request that has passed cost computation and is ready to dispatch.
#[derive(Debug, Clone)]
pub struct PricedRequest {
    pub request_id: String,
    pub user_id: String,
    pub params: ProviderParams,
    pub cost: Cost,
}

/// What an adapter returns on success.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// Upstream body, relayed to the caller as-is.
    pub payload: Value,
    /// Usage reported by the provider. Takes precedence over the estimate.
    pub usage: Option<Units>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_image_params_defaults() {
        let params: ImageParams = serde_json::from_value(json!({"prompt": "a lighthouse"})).unwrap();
        assert_eq!(params.model, "dall-e-2");
        assert_eq!(params.n, 1);
        assert_eq!(params.size, "1024x1024");
        assert_eq!(params.response_format, "b64_json");
    }

    #[test]
    fn test_image_params_response_format_spellings() {
        let camel: ImageParams =
            serde_json::from_value(json!({"prompt": "x", "responseFormat": "url"})).unwrap();
        let snake: ImageParams =
            serde_json::from_value(json!({"prompt": "x", "response_format": "url"})).unwrap();
        assert_eq!(camel.response_format, "url");
        assert_eq!(snake.response_format, "url");
    }

    #[test]
    fn test_from_body_rejects_bad_image_body() {
        assert!(ProviderParams::from_body(ProviderKind::Image, json!({"n": -1})).is_err());
        assert!(ProviderParams::from_body(ProviderKind::Image, json!("text")).is_err());
    }

    #[test]
    fn test_from_body_text_is_opaque() {
        let body = json!({"contents": [{"parts": [{"text": "hi"}]}]});
        let params = ProviderParams::from_body(ProviderKind::Text, body.clone()).unwrap();
        assert_eq!(params, ProviderParams::Text(body));
    }
}
