//! GlobalModel tiered-pricing configuration.
//!
//! This is the shape an operator configures per [`GlobalModel`](spec §3): a
//! non-empty ladder of tiers keyed by `total_input_context` (prompt tokens
//! plus cache-read tokens), each carrying per-dimension per-1M prices. The
//! actual evaluation against observed usage lives in
//! `relay_provider_core::billing` — this module only owns the config shape
//! so the admin layer and the billing engine agree on it.

use serde::{Deserialize, Serialize};

/// Per-tier override for cache pricing keyed on the request's requested TTL
/// (spec §4.10's `cache_ttl_pricing`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTtlOverride {
    pub ttl_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_price_per_1m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_price_per_1m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTier {
    /// Upper bound (inclusive) of `total_input_context` this tier covers.
    /// `None` means unbounded — the last tier in a ladder should normally
    /// be `None` so every request resolves to some tier.
    pub up_to: Option<u64>,
    pub input_price_per_1m: f64,
    pub output_price_per_1m: f64,
    /// `None` derives from `input_price_per_1m * 1.25` at resolution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_price_per_1m: Option<f64>,
    /// `None` derives from `input_price_per_1m * 0.1` at resolution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_price_per_1m: Option<f64>,
    #[serde(default)]
    pub price_per_request: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_ttl_pricing: Vec<CacheTtlOverride>,
}

impl PricingTier {
    pub fn resolved_cache_creation_price(&self) -> f64 {
        self.cache_creation_price_per_1m
            .unwrap_or(self.input_price_per_1m * 1.25)
    }

    pub fn resolved_cache_read_price(&self) -> f64 {
        self.cache_read_price_per_1m
            .unwrap_or(self.input_price_per_1m * 0.1)
    }
}

/// A canonical model's pricing ladder (spec §3 `GlobalModel.tiered_pricing`).
/// `tiers` must be non-empty; the first tier is the default price for a
/// model with no tiering at all (a single `up_to: None` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModelPricing {
    pub model: String,
    pub tiers: Vec<PricingTier>,
}

impl GlobalModelPricing {
    /// First tier whose `up_to` is `None` or `>= total_input_context` wins;
    /// falls back to the last tier if every bound was exceeded (so a
    /// misconfigured ladder without a trailing unbounded tier still prices
    /// something, rather than failing the request's billing step).
    pub fn resolve_tier(&self, total_input_context: u64) -> Option<&PricingTier> {
        self.tiers
            .iter()
            .find(|t| t.up_to.is_none_or(|cap| total_input_context <= cap))
            .or_else(|| self.tiers.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(up_to: Option<u64>, input: f64, output: f64) -> PricingTier {
        PricingTier {
            up_to,
            input_price_per_1m: input,
            output_price_per_1m: output,
            cache_creation_price_per_1m: None,
            cache_read_price_per_1m: None,
            price_per_request: 0.0,
            cache_ttl_pricing: Vec::new(),
        }
    }

    #[test]
    fn resolves_first_tier_that_fits() {
        let pricing = GlobalModelPricing {
            model: "claude-test".to_string(),
            tiers: vec![tier(Some(200_000), 3.0, 15.0), tier(None, 6.0, 22.5)],
        };
        assert_eq!(pricing.resolve_tier(1_000).unwrap().input_price_per_1m, 3.0);
        assert_eq!(
            pricing.resolve_tier(200_001).unwrap().input_price_per_1m,
            6.0
        );
    }

    #[test]
    fn falls_back_to_last_tier_without_unbounded_entry() {
        let pricing = GlobalModelPricing {
            model: "claude-test".to_string(),
            tiers: vec![tier(Some(1_000), 3.0, 15.0)],
        };
        assert_eq!(
            pricing.resolve_tier(5_000_000).unwrap().input_price_per_1m,
            3.0
        );
    }

    #[test]
    fn derives_cache_prices_when_unset() {
        let t = tier(None, 4.0, 20.0);
        assert_eq!(t.resolved_cache_creation_price(), 5.0);
        assert_eq!(t.resolved_cache_read_price(), 0.4);
    }
}
