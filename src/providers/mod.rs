//! Upstream providers.
//!
//! Defines the [`CompletionService`] trait and error type, the price table and
//! cost model, and the concrete adapters (OpenAI image generation, Gemini
//! `generateContent`).

pub mod cost;
pub mod gemini;
pub mod openai_images;
pub mod pricing;
pub mod registry;
pub mod types;

use std::future::Future;
use std::pin::Pin;

use crate::providers::types::{PricedRequest, ProviderKind, ProviderParams, ProviderResponse};

// Re-exports for convenience.
pub use self::cost::CostModel;
pub use self::gemini::GeminiText;
pub use self::openai_images::OpenAiImages;
pub use self::pricing::PriceTable;
pub use self::registry::ProviderRegistry;

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors that can occur during provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No provider registered for {0}")]
    NoProvider(String),

    /// Parameters that do not fit the adapter; never sent upstream.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Upstream answered 2xx with a body that is not JSON.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// CompletionService trait
// ---------------------------------------------------------------------------

/// A single upstream generative-AI endpoint.
///
/// Async methods return boxed futures so the trait is dyn-compatible (can be
/// used as `Arc<dyn CompletionService>`).
pub trait CompletionService: Send + Sync {
    /// Unique identifier used in logs and the usage log (e.g. "gemini").
    fn id(&self) -> &str;

    /// Which proxy route this service serves.
    fn kind(&self) -> ProviderKind;

    /// Model the request will run on, for metering records.
    fn model(&self, params: &ProviderParams) -> String;

    /// Forward the request and return the upstream payload untouched, plus
    /// any usage the provider reported.
    fn complete<'a>(
        &'a self,
        request: &'a PricedRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, ProviderError>> + Send + 'a>>;
}

/// Map a non-success upstream response to [`ProviderError::Api`].
pub(crate) async fn api_error(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    ProviderError::Api { status, message }
}
