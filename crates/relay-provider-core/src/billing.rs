//! Billing Engine: evaluates a per-`GlobalModel` tiered-pricing expression
//! over observed usage dimensions (spec §4.10).
//!
//! Pure and synchronous by design — it never touches the coordination store
//! or the relational store, so it can run on the stream-tracker's hot path
//! without a suspension point. The caller (Usage Recorder) is responsible
//! for persisting the resulting [`BillingSnapshot`] and for treating a
//! resolution failure as fatal to billing only, never to the request
//! (spec §7: "Billing errors ... are fatal to the billing step only").

use relay_common::{GlobalModelPricing, PricingTier};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageDimensions {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub request_count: u64,
    /// Present when the request asked for a specific cache TTL, so a
    /// tier's `cache_ttl_pricing` override can apply.
    pub cache_ttl_minutes: Option<u32>,
}

impl UsageDimensions {
    pub fn total_input_context(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub request_cost: f64,
}

impl BillingBreakdown {
    pub fn sum(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_creation_cost + self.cache_read_cost
            + self.request_cost
    }
}

/// The variables actually resolved for this request: the selected tier's
/// prices plus the raw usage dimensions, kept for audit/replay (spec §8
/// "BillingSnapshot replay").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVariables {
    pub total_input_context: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub request_count: u64,
    pub input_price_per_1m: f64,
    pub output_price_per_1m: f64,
    pub cache_creation_price_per_1m: f64,
    pub cache_read_price_per_1m: f64,
    pub price_per_request: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSnapshot {
    pub breakdown: BillingBreakdown,
    pub resolved_variables: ResolvedVariables,
    pub total_cost: f64,
    pub actual_total_cost: f64,
    pub rate_multiplier: f64,
    pub is_free_tier: bool,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("pricing ladder for model has no tiers")]
    NoTiers,
}

fn select_tier<'a>(
    pricing: &'a GlobalModelPricing,
    usage: &UsageDimensions,
) -> Result<&'a PricingTier, BillingError> {
    pricing
        .resolve_tier(usage.total_input_context())
        .ok_or(BillingError::NoTiers)
}

fn cache_prices(tier: &PricingTier, usage: &UsageDimensions) -> (f64, f64) {
    let mut creation = tier.resolved_cache_creation_price();
    let mut read = tier.resolved_cache_read_price();
    if let Some(ttl) = usage.cache_ttl_minutes {
        if let Some(ov) = tier.cache_ttl_pricing.iter().find(|o| o.ttl_minutes == ttl) {
            if let Some(p) = ov.cache_creation_price_per_1m {
                creation = p;
            }
            if let Some(p) = ov.cache_read_price_per_1m {
                read = p;
            }
        }
    }
    (creation, read)
}

/// Evaluates the default pricing expression (spec §4.10) for `usage` against
/// `pricing`, scaling every cost component by `rate_multiplier` into the
/// `actual_*` fields. `is_free_tier` forces `actual_total_cost` to zero while
/// leaving the billable (surface) `total_cost` intact for statistics.
pub fn compute_billing(
    pricing: &GlobalModelPricing,
    usage: &UsageDimensions,
    rate_multiplier: f64,
    is_free_tier: bool,
) -> Result<BillingSnapshot, BillingError> {
    let tier = select_tier(pricing, usage)?;
    let (cache_creation_price, cache_read_price) = cache_prices(tier, usage);

    let input_cost = usage.input_tokens as f64 * tier.input_price_per_1m / 1_000_000.0;
    let output_cost = usage.output_tokens as f64 * tier.output_price_per_1m / 1_000_000.0;
    let cache_creation_cost =
        usage.cache_creation_tokens as f64 * cache_creation_price / 1_000_000.0;
    let cache_read_cost = usage.cache_read_tokens as f64 * cache_read_price / 1_000_000.0;
    let request_cost = usage.request_count as f64 * tier.price_per_request;

    let breakdown = BillingBreakdown {
        input_cost,
        output_cost,
        cache_creation_cost,
        cache_read_cost,
        request_cost,
    };
    let total_cost = breakdown.sum();
    let actual_total_cost = if is_free_tier {
        0.0
    } else {
        total_cost * rate_multiplier
    };

    Ok(BillingSnapshot {
        breakdown,
        resolved_variables: ResolvedVariables {
            total_input_context: usage.total_input_context(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            request_count: usage.request_count,
            input_price_per_1m: tier.input_price_per_1m,
            output_price_per_1m: tier.output_price_per_1m,
            cache_creation_price_per_1m: cache_creation_price,
            cache_read_price_per_1m: cache_read_price,
            price_per_request: tier.price_per_request,
        },
        total_cost,
        actual_total_cost,
        rate_multiplier,
        is_free_tier,
    })
}

/// Replays a previously computed snapshot's resolved variables to confirm
/// `total_cost` still reproduces to within 1e-9 (spec §8 round-trip law).
pub fn replay(snapshot: &BillingSnapshot) -> f64 {
    let v = &snapshot.resolved_variables;
    let input_cost = v.input_tokens as f64 * v.input_price_per_1m / 1_000_000.0;
    let output_cost = v.output_tokens as f64 * v.output_price_per_1m / 1_000_000.0;
    let cache_creation_cost =
        v.cache_creation_tokens as f64 * v.cache_creation_price_per_1m / 1_000_000.0;
    let cache_read_cost = v.cache_read_tokens as f64 * v.cache_read_price_per_1m / 1_000_000.0;
    let request_cost = v.request_count as f64 * v.price_per_request;
    input_cost + output_cost + cache_creation_cost + cache_read_cost + request_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> GlobalModelPricing {
        GlobalModelPricing {
            model: "claude-test".to_string(),
            tiers: vec![
                PricingTier {
                    up_to: Some(200_000),
                    input_price_per_1m: 3.0,
                    output_price_per_1m: 15.0,
                    cache_creation_price_per_1m: None,
                    cache_read_price_per_1m: None,
                    price_per_request: 0.0,
                    cache_ttl_pricing: vec![],
                },
                PricingTier {
                    up_to: None,
                    input_price_per_1m: 6.0,
                    output_price_per_1m: 22.5,
                    cache_creation_price_per_1m: Some(7.5),
                    cache_read_price_per_1m: Some(0.6),
                    price_per_request: 0.0,
                    cache_ttl_pricing: vec![],
                },
            ],
        }
    }

    #[test]
    fn computes_default_tier_cost() {
        let usage = UsageDimensions {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            request_count: 0,
            cache_ttl_minutes: None,
        };
        let snap = compute_billing(&pricing(), &usage, 1.0, false).unwrap();
        assert_eq!(snap.breakdown.input_cost, 3.0);
        assert_eq!(snap.breakdown.output_cost, 15.0);
        assert_eq!(snap.total_cost, 18.0);
        assert_eq!(snap.actual_total_cost, 18.0);
    }

    #[test]
    fn derives_cache_prices_from_input_when_unset_on_selected_tier() {
        let usage = UsageDimensions {
            input_tokens: 100_000,
            output_tokens: 0,
            cache_creation_tokens: 1_000_000,
            cache_read_tokens: 1_000_000,
            request_count: 0,
            cache_ttl_minutes: None,
        };
        // total_input_context = 100_000 -> first tier (input price 3.0)
        let snap = compute_billing(&pricing(), &usage, 1.0, false).unwrap();
        assert_eq!(snap.breakdown.cache_creation_cost, 3.75); // 3.0 * 1.25
        assert_eq!(snap.breakdown.cache_read_cost, 0.3); // 3.0 * 0.1
    }

    #[test]
    fn cache_ttl_override_wins_over_derived_price() {
        let mut p = pricing();
        p.tiers[0].cache_ttl_pricing.push(relay_common::CacheTtlOverride {
            ttl_minutes: 60,
            cache_creation_price_per_1m: Some(1.0),
            cache_read_price_per_1m: None,
        });
        let usage = UsageDimensions {
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 1_000_000,
            cache_read_tokens: 1_000_000,
            request_count: 0,
            cache_ttl_minutes: Some(60),
        };
        let snap = compute_billing(&p, &usage, 1.0, false).unwrap();
        assert_eq!(snap.breakdown.cache_creation_cost, 1.0);
        // input_price_per_1m is 0.0 here (tier 0 has up_to Some(200_000), total_input_context 0
        // still selects tier 0), so the un-overridden read price derives to 0.0.
    }

    #[test]
    fn rate_multiplier_scales_actual_cost_but_not_surface_cost() {
        let usage = UsageDimensions {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            request_count: 0,
            cache_ttl_minutes: None,
        };
        let snap = compute_billing(&pricing(), &usage, 2.0, false).unwrap();
        assert_eq!(snap.total_cost, 3.0);
        assert_eq!(snap.actual_total_cost, 6.0);
    }

    #[test]
    fn free_tier_zeros_actual_cost_only() {
        let usage = UsageDimensions {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            request_count: 0,
            cache_ttl_minutes: None,
        };
        let snap = compute_billing(&pricing(), &usage, 1.0, true).unwrap();
        assert_eq!(snap.total_cost, 3.0);
        assert_eq!(snap.actual_total_cost, 0.0);
        assert!(snap.is_free_tier);
    }

    #[test]
    fn request_cost_is_additive() {
        let mut p = pricing();
        p.tiers[0].price_per_request = 0.01;
        let usage = UsageDimensions {
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            request_count: 3,
            cache_ttl_minutes: None,
        };
        let snap = compute_billing(&p, &usage, 1.0, false).unwrap();
        assert_eq!(snap.breakdown.request_cost, 0.03);
    }

    #[test]
    fn empty_pricing_ladder_is_an_error() {
        let p = GlobalModelPricing {
            model: "broken".to_string(),
            tiers: vec![],
        };
        let usage = UsageDimensions::default();
        assert_eq!(compute_billing(&p, &usage, 1.0, false), Err(BillingError::NoTiers));
    }

    #[test]
    fn replay_reproduces_total_cost() {
        let usage = UsageDimensions {
            input_tokens: 123_456,
            output_tokens: 7_890,
            cache_creation_tokens: 4_000,
            cache_read_tokens: 9_000,
            request_count: 1,
            cache_ttl_minutes: None,
        };
        let snap = compute_billing(&pricing(), &usage, 1.3, false).unwrap();
        assert!((replay(&snap) - snap.total_cost).abs() < 1e-9);
    }
}
