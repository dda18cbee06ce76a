//! Cost model for proxied requests.
//!
//! Images are priced before the call from the price table. Text is priced
//! after the call from the provider's usage report, so its cost is deferred.

use super::pricing::PriceTable;
use super::types::{ImageParams, ProviderParams};
use crate::quota::{Cost, UnitKind, Units};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CostError {
    #[error("no price for model '{model}' at size '{size}'")]
    UnsupportedConfiguration { model: String, size: String },

    #[error("{0}")]
    InvalidRequest(String),
}

// MARK: - Cost Model

pub struct CostModel {
    prices: PriceTable,
}

impl CostModel {
    pub fn new(prices: PriceTable) -> Self {
        Self { prices }
    }

    /// Price a request. Pure: reads only the price table.
    pub fn cost(&self, params: &ProviderParams) -> Result<Cost, CostError> {
        match params {
            ProviderParams::Image(image) => self.image_cost(image),
            ProviderParams::Text(_) => Ok(Cost::Deferred(UnitKind::Text)),
        }
    }

    fn image_cost(&self, params: &ImageParams) -> Result<Cost, CostError> {
        if params.prompt.trim().is_empty() {
            return Err(CostError::InvalidRequest("prompt is required".to_string()));
        }
        if params.n == 0 {
            return Err(CostError::InvalidRequest("n must be at least 1".to_string()));
        }

        let unit_price = self
            .prices
            .unit_price(&params.model, &params.size)
            .ok_or_else(|| CostError::UnsupportedConfiguration {
                model: params.model.clone(),
                size: params.size.clone(),
            })?;

        let units = unit_price * f64::from(params.n);
        debug!(
            model = %params.model,
            size = %params.size,
            n = params.n,
            units,
            "Calculated image cost"
        );
        Ok(Cost::Upfront(Units::Image(units)))
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new(PriceTable::new())
    }
}

// MARK: - Tests
