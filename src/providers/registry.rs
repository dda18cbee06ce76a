//! Provider Registry
//!
//! Maps each [`ProviderKind`] to the adapter that serves it. The proxy routes
//! differ only in the kind they look up here.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::providers::types::ProviderKind;
use crate::providers::{CompletionService, ProviderError};

/// Summary of a registered adapter for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub kind: ProviderKind,
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CompletionService>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn CompletionService>) {
        let kind = provider.kind();
        let id = provider.id().to_string();
        if let Some(previous) = self.providers.insert(kind, provider) {
            warn!(kind = %kind, previous = %previous.id(), replacement = %id, "Replacing registered provider");
        } else {
            info!(kind = %kind, provider = %id, "Registered provider");
        }
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn CompletionService>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ProviderError::NoProvider(kind.to_string()))
    }

    /// Registered adapters, image first.
    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut list: Vec<ProviderInfo> = self
            .providers
            .values()
            .map(|p| ProviderInfo {
                id: p.id().to_string(),
                kind: p.kind(),
            })
            .collect();
        list.sort_by_key(|p| p.kind.as_str());
        list
    }
}
