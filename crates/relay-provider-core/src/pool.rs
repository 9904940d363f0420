//! Pool Manager: health-aware ordering of candidate keys within one
//! provider, plus the cross-process bookkeeping (sticky sessions, LRU,
//! cost windows, session admission) that the in-process [`CredentialPool`]
//! alone doesn't carry.
//!
//! [`CredentialPool`] already owns the cooldown/circuit state (`Active` /
//! `Unavailable { until, reason }`) for each credential, recovered off a
//! delayed background queue. `PoolManager` sits in front of it and adds the
//! pieces spec'd for candidate reordering: a sticky-session hint, a
//! least-recently-used tiebreak, and a sliding-window cost budget, all
//! backed by a [`CoordinationStore`] so they survive a multi-process
//! deployment (or degrade gracefully to "unknown" on a single node without
//! one).

use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use relay_common::{Availability, CoordinationStore, PoolConfig};

use crate::credential::CredentialId;

/// One scheduling-relevant fact about a candidate key, gathered from the
/// coordination store ahead of ordering.
#[derive(Debug, Clone)]
pub struct CandidateHealth {
    pub credential_id: CredentialId,
    pub on_cooldown: bool,
    pub cost_ratio: Option<f64>,
    pub last_used_score: f64,
    pub sticky_hit: bool,
}

/// Outcome of reordering a candidate list: kept candidates in preference
/// order, plus any that were dropped outright with a reason to surface in
/// the Candidate Builder's skip log.
pub struct ReorderResult {
    pub ordered: Vec<CredentialId>,
    pub skipped: Vec<(CredentialId, &'static str)>,
}

pub struct PoolManager {
    store: std::sync::Arc<dyn CoordinationStore>,
    config: PoolConfig,
}

fn sticky_key(provider: &str, session_id: &str) -> String {
    format!("sticky:{provider}:{session_id}")
}

fn lru_key(provider: &str) -> String {
    format!("lru:{provider}")
}

fn cost_key(provider: &str, credential_id: CredentialId) -> String {
    format!("cost:{provider}:{credential_id}")
}

fn session_key(credential_id: CredentialId, session_id: &str) -> String {
    format!("session:{credential_id}:{session_id}")
}

fn session_count_key(credential_id: CredentialId) -> String {
    format!("session_count:{credential_id}")
}

impl PoolManager {
    pub fn new(store: std::sync::Arc<dyn CoordinationStore>, config: PoolConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Looks up the key bound to `session_id` for `provider`, if any and
    /// still within its sticky TTL. Returns `None` both when there is no
    /// binding and when the coordination store is degraded — callers treat
    /// both the same way (fall back to normal ordering).
    pub async fn sticky_candidate(&self, provider: &str, session_id: &str) -> Option<CredentialId> {
        let key = sticky_key(provider, session_id);
        match self.store.get(&key).await {
            Availability::Known(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<CredentialId>().ok()),
            _ => None,
        }
    }

    /// Records that `credential_id` served `session_id`, refreshing the
    /// sticky binding's TTL (spec.md §4.5.2's post-success hook).
    pub async fn refresh_sticky(&self, provider: &str, session_id: &str, credential_id: CredentialId) {
        let key = sticky_key(provider, session_id);
        let ttl = Duration::from_secs(self.config.sticky_session_ttl_secs);
        let _ = self
            .store
            .set_ttl(&key, Bytes::from(credential_id.to_string()), ttl)
            .await;
    }

    /// Touches `credential_id`'s LRU timestamp. Scores are plain epoch
    /// seconds; `zrange` naturally yields least-recently-used first.
    pub async fn touch_lru(&self, provider: &str, credential_id: CredentialId, now_secs: f64) {
        let key = lru_key(provider);
        let _ = self.store.zadd(&key, &credential_id.to_string(), now_secs).await;
    }

    /// Appends `cost` to `credential_id`'s sliding cost window and returns
    /// the running total, or `None` if the store is degraded (callers then
    /// treat cost as unconstrained rather than blocking traffic).
    pub async fn record_cost(&self, provider: &str, credential_id: CredentialId, cost_cents: i64) -> Option<i64> {
        let key = cost_key(provider, credential_id);
        let ttl = Duration::from_secs(self.config.cost_window_secs);
        self.store.incr(&key, cost_cents, ttl).await.known()
    }

    /// Orders `candidates` for dispatch: sticky hit first (if present among
    /// the candidate set and not on cooldown), then ascending LRU, with
    /// over-soft-threshold-cost candidates pushed to the end and random
    /// tie-breaks among equally-scored candidates (spec.md §4.5.1).
    pub async fn reorder(
        &self,
        provider: &str,
        session_id: Option<&str>,
        candidates: Vec<CredentialId>,
        cooldown: impl Fn(CredentialId) -> bool,
        budget_cents: impl Fn(CredentialId) -> Option<i64>,
    ) -> ReorderResult {
        let sticky = match session_id {
            Some(sid) => self.sticky_candidate(provider, sid).await,
            None => None,
        };

        let lru_key = lru_key(provider);
        let scores = match self.store.zrange(&lru_key, f64::MIN, f64::MAX).await {
            Availability::Known(rows) => rows.into_iter().collect::<std::collections::HashMap<_, _>>(),
            Availability::Unknown => std::collections::HashMap::new(),
        };

        let mut kept = Vec::new();
        let mut skipped = Vec::new();
        let mut soft_penalized = Vec::new();

        for id in candidates {
            if cooldown(id) {
                skipped.push((id, "cooldown"));
                continue;
            }
            let used_cost = self.store.peek_counter(&cost_key(provider, id)).await.known();
            let budget = budget_cents(id).or(self.config.default_cost_limit_tokens);
            if let (Some(used), Some(limit)) = (used_cost, budget)
                && limit > 0
                && used >= limit
            {
                skipped.push((id, "cost_exhausted"));
                continue;
            }
            let over_soft = match (used_cost, budget) {
                (Some(used), Some(budget)) if budget > 0 => {
                    (used as f64 / budget as f64) >= self.config.cost_soft_threshold_pct
                }
                _ => false,
            };
            let last_used = scores.get(&id.to_string()).copied().unwrap_or(0.0);
            let is_sticky = sticky == Some(id);
            kept.push((
                id,
                CandidateHealth {
                    credential_id: id,
                    on_cooldown: false,
                    cost_ratio: used_cost.map(|u| u as f64),
                    last_used_score: last_used,
                    sticky_hit: is_sticky,
                },
                over_soft,
            ));
        }

        kept.shuffle(&mut rand::thread_rng());
        kept.sort_by(|a, b| {
            b.1.sticky_hit
                .cmp(&a.1.sticky_hit)
                .then(a.2.cmp(&b.2))
                .then(a.1.last_used_score.total_cmp(&b.1.last_used_score))
        });

        for (id, _health, over_soft) in &kept {
            if *over_soft {
                soft_penalized.push(*id);
            }
        }

        ReorderResult {
            ordered: kept.into_iter().map(|(id, ..)| id).collect(),
            skipped,
        }
    }

    /// Admits a new session onto `credential_id`, respecting
    /// `max_concurrent_sessions` (`0` = unlimited). Returns `true` if the
    /// session was admitted (or the store is degraded, in which case the
    /// gateway fails open rather than refusing traffic over a control-plane
    /// outage).
    pub async fn admit_session(&self, credential_id: CredentialId, session_id: &str) -> bool {
        if self.config.max_concurrent_sessions == 0 {
            return true;
        }
        let claimed = self
            .store
            .try_claim(&session_key(credential_id, session_id), Duration::from_secs(3600))
            .await;
        if matches!(claimed, Availability::Known(false)) {
            // Already holding this session's slot (a retry from the same
            // session) — not a new admission, so don't double count.
            return true;
        }
        let count = self
            .store
            .incr(&session_count_key(credential_id), 1, Duration::from_secs(3600))
            .await
            .known();
        match count {
            Some(n) => n <= self.config.max_concurrent_sessions as i64,
            None => true,
        }
    }

    pub async fn release_session(&self, credential_id: CredentialId, session_id: &str) {
        let _ = self.store.remove(&session_key(credential_id, session_id)).await;
        let _ = self
            .store
            .incr(&session_count_key(credential_id), -1, Duration::from_secs(3600))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::LocalCoordinationStore;
    use std::sync::Arc;

    fn manager() -> PoolManager {
        PoolManager::new(Arc::new(LocalCoordinationStore::new()), PoolConfig::default())
    }

    #[tokio::test]
    async fn sticky_candidate_round_trips() {
        let pool = manager();
        assert!(pool.sticky_candidate("claude", "session-1").await.is_none());
        pool.refresh_sticky("claude", "session-1", 42).await;
        assert_eq!(pool.sticky_candidate("claude", "session-1").await, Some(42));
    }

    #[tokio::test]
    async fn reorder_skips_cooldown_and_prefers_sticky() {
        let pool = manager();
        pool.refresh_sticky("claude", "s1", 2).await;
        pool.touch_lru("claude", 1, 100.0).await;
        pool.touch_lru("claude", 2, 50.0).await;
        pool.touch_lru("claude", 3, 10.0).await;

        let result = pool
            .reorder(
                "claude",
                Some("s1"),
                vec![1, 2, 3],
                |id| id == 3,
                |_| None,
            )
            .await;
        assert_eq!(result.skipped, vec![(3, "cooldown")]);
        assert_eq!(result.ordered.first(), Some(&2));
    }

    #[tokio::test]
    async fn reorder_skips_cost_exhausted_key() {
        let pool = manager();
        pool.record_cost("claude", 1, 10_000).await;
        pool.touch_lru("claude", 1, 10.0).await;
        pool.touch_lru("claude", 2, 5.0).await;

        let result = pool
            .reorder(
                "claude",
                None,
                vec![1, 2],
                |_| false,
                |id| if id == 1 { Some(10_000) } else { None },
            )
            .await;
        assert_eq!(result.skipped, vec![(1, "cost_exhausted")]);
        assert_eq!(result.ordered, vec![2]);
    }

    #[tokio::test]
    async fn reorder_soft_penalizes_without_skipping() {
        let pool = manager();
        pool.record_cost("claude", 1, 9_800).await;
        pool.touch_lru("claude", 1, 5.0).await;
        pool.touch_lru("claude", 2, 10.0).await;

        let result = pool
            .reorder(
                "claude",
                None,
                vec![1, 2],
                |_| false,
                |id| if id == 1 { Some(10_000) } else { None },
            )
            .await;
        assert!(result.skipped.is_empty());
        assert_eq!(result.ordered, vec![2, 1]);
    }

    #[tokio::test]
    async fn session_admission_respects_limit() {
        let mut config = PoolConfig::default();
        config.max_concurrent_sessions = 1;
        let pool = PoolManager::new(Arc::new(LocalCoordinationStore::new()), config);
        assert!(pool.admit_session(1, "s-a").await);
        assert!(!pool.admit_session(1, "s-b").await);
        pool.release_session(1, "s-a").await;
    }
}
