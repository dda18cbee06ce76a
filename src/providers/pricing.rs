//! Image price table.
//!
//! Prices are quota units per generated image, keyed by model and size.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// MARK: - Types

/// Price of one image for a (model, size) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePrice {
    /// Model identifier (e.g., "dall-e-3").
    pub model: String,
    /// Output size (e.g., "1024x1024").
    pub size: String,
    /// Quota units charged per image.
    pub units: f64,
}

/// Lookup table from (model, size) to units per image.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<(String, String), f64>,
}

// MARK: - Implementation

impl PriceTable {
    /// Create a price table with the built-in image prices.
    pub fn new() -> Self {
        let mut table = Self {
            prices: HashMap::new(),
        };
        for (model, size, units) in [
            ("dall-e-3", "1024x1024", 0.040),
            ("dall-e-3", "1024x1792", 0.080),
            ("dall-e-2", "1024x1024", 0.020),
            ("dall-e-2", "512x512", 0.018),
            ("dall-e-2", "256x256", 0.016),
        ] {
            table.insert(model, size, units);
        }
        table
    }

    /// Built-in prices extended or overridden by configured entries.
    pub fn with_overrides(overrides: &[ImagePrice]) -> Self {
        let mut table = Self::new();
        for price in overrides {
            table.insert(&price.model, &price.size, price.units);
        }
        table
    }

    fn insert(&mut self, model: &str, size: &str, units: f64) {
        self.prices
            .insert((model.to_string(), size.to_string()), units);
    }

    /// Units per image, or `None` when the combination has no price.
    pub fn unit_price(&self, model: &str, size: &str) -> Option<f64> {
        self.prices
            .get(&(model.to_string(), size.to_string()))
            .copied()
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new()
    }
}

// MARK: - Tests
