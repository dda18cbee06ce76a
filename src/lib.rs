pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod quota;

use crate::auth::{ApiKeyAuthenticator, Authenticator};
use crate::config::Config;
use crate::db::Database;
use crate::providers::{CostModel, PriceTable, ProviderRegistry};
use crate::quota::{AuditEntry, QuotaLedger, UsageRecorder};

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub authenticator: Arc<dyn Authenticator>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub recorder: UsageRecorder,
    pub providers: Arc<ProviderRegistry>,
    pub cost_model: Arc<CostModel>,
    pub audit_tx: UnboundedSender<AuditEntry>,
}

impl AppState {
    /// Wire up state with API-key authentication and the configured price table.
    pub fn new(
        config: Config,
        db: Database,
        ledger: Arc<dyn QuotaLedger>,
        providers: ProviderRegistry,
        audit_tx: UnboundedSender<AuditEntry>,
    ) -> Self {
        let prices = PriceTable::with_overrides(&config.pricing.image);
        Self {
            authenticator: Arc::new(ApiKeyAuthenticator::new(db.clone())),
            recorder: UsageRecorder::new(Arc::clone(&ledger)),
            cost_model: Arc::new(CostModel::new(prices)),
            providers: Arc::new(providers),
            config: Arc::new(config),
            db,
            ledger,
            audit_tx,
        }
    }
}
