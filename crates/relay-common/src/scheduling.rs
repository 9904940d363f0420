//! Operator-tunable knobs for pool scheduling and usage retention.
//!
//! These are plain config structs, not behaviour: `relay-provider-core::pool`
//! and `relay-storage::usage` read them but own the logic that interprets
//! them. Kept here so the admin layer (out of this crate's scope) and the
//! scheduler/pool manager agree on one shape.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerMode {
    /// Exhaust all keys of the first eligible provider (by priority) before
    /// trying the next provider.
    ProviderFirst,
    /// Rank every (provider, key) candidate together by priority/score.
    GlobalKeyFirst,
}

impl Default for SchedulerMode {
    fn default() -> Self {
        SchedulerMode::ProviderFirst
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
    /// When true, candidates already used by this session's prior turn sort
    /// first (an ordering hint only, never a hard requirement).
    pub prefer_cache_affinity: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::default(),
            prefer_cache_affinity: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Share of a key's cost budget at which it is pushed to the back of the
    /// candidate order instead of being skipped outright.
    pub cost_soft_threshold_pct: f64,
    /// Width of the sliding window used for per-key cost accounting.
    pub cost_window_secs: u64,
    /// TTL for a sticky-session -> key binding.
    pub sticky_session_ttl_secs: u64,
    /// Max concurrent sessions a single key will accept (Claude-CLI dialect
    /// only); `0` disables the limit.
    pub max_concurrent_sessions: u32,
    /// Default per-key token budget over `cost_window_secs`, used when a
    /// credential doesn't carry its own `cost_limit_tokens` override. `None`
    /// leaves keys unconstrained (spec.md's `cost_limit_per_key_tokens?`).
    pub default_cost_limit_tokens: Option<i64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cost_soft_threshold_pct: 0.8,
            cost_window_secs: 3600,
            sticky_session_ttl_secs: 600,
            max_concurrent_sessions: 0,
            default_cost_limit_tokens: None,
        }
    }
}

/// Cutoffs (in days since a Usage row's `created_at`) for the body/header
/// compression-then-deletion lifecycle, plus the batch size for each sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Age at which uncompressed `request_body`/`response_body` are gzipped
    /// into their companion columns.
    pub detail_days: u32,
    /// Age at which compressed bodies are cleared entirely.
    pub compressed_days: u32,
    /// Age at which stored headers are cleared.
    pub header_days: u32,
    /// Age at which the row itself is deleted.
    pub log_days: u32,
    /// Max rows touched per compression/clear/delete sweep.
    pub batch_size: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            detail_days: 7,
            compressed_days: 90,
            header_days: 90,
            log_days: 365,
            batch_size: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let pool = PoolConfig::default();
        assert!(pool.cost_soft_threshold_pct > 0.0 && pool.cost_soft_threshold_pct <= 1.0);
        let retention = RetentionConfig::default();
        assert!(retention.detail_days <= retention.compressed_days);
        assert!(retention.compressed_days <= retention.log_days);
    }
}
