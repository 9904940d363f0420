//! Coordination store client: the shared, cross-process view of pool health
//! (cooldowns, LRU timestamps, cost windows, sticky sessions) that sits
//! outside the request-local hot path.
//!
//! A real deployment backs this with something like Redis; this crate ships
//! only an in-process implementation (`LocalCoordinationStore`), which is
//! sufficient for a single-node gateway and for tests. The trait is written
//! so a networked backend can be dropped in later without touching callers.
//!
//! Every method returns [`Availability<T>`] rather than a bare `Result`: a
//! coordination store outage must never fail a request outright, so callers
//! are forced to decide what "I don't know" means for them (usually: treat
//! the candidate as schedulable and let the upstream call itself fail fast).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// The result of a coordination-store call: either a definite answer, or
/// "unknown" because the backing store is unreachable or degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability<T> {
    Known(T),
    Unknown,
}

impl<T> Availability<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Availability::Known(value) => Some(value),
            Availability::Unknown => None,
        }
    }

    /// Unwraps to a caller-supplied default when the store is degraded.
    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Availability::Known(value) => value,
            Availability::Unknown => default,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Availability::Unknown)
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Fetches a raw value, if present and unexpired.
    async fn get(&self, key: &str) -> Availability<Option<Bytes>>;

    /// Sets a value with a time-to-live. A `ttl` of zero means "no expiry".
    async fn set_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Availability<()>;

    /// Deletes a key outright (used to clear a cooldown early).
    async fn remove(&self, key: &str) -> Availability<()>;

    /// Atomically adds `delta` to a counter, refreshing its TTL, and returns
    /// the counter's new value. Used for request-count and cost-window
    /// accounting (spec.md §4.5.3's sliding-window cost counter).
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Availability<i64>;

    /// Reads a counter's current value without mutating it or its TTL.
    /// Missing or expired counters read as `0`.
    async fn peek_counter(&self, key: &str) -> Availability<i64>;

    /// Inserts or updates a member's score in a sorted set (used for LRU
    /// ordering and sticky-session timestamps).
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Availability<()>;

    /// Returns members with `min_score <= score <= max_score`, ascending.
    async fn zrange(&self, key: &str, min_score: f64, max_score: f64)
    -> Availability<Vec<(String, f64)>>;

    /// Removes members with `min_score <= score <= max_score` (sliding-window
    /// garbage collection).
    async fn zrem_range_by_score(&self, key: &str, min_score: f64, max_score: f64) -> Availability<()>;

    /// Removes a single member from a sorted set.
    async fn zrem(&self, key: &str, member: &str) -> Availability<()>;

    /// Atomic "claim if absent, with TTL" — the primitive behind session
    /// admission control and any future distributed-lock need. Returns
    /// `true` if this call won the claim.
    async fn try_claim(&self, key: &str, ttl: Duration) -> Availability<bool>;
}

#[derive(Clone)]
struct ScalarEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct SortedSet {
    members: HashMap<String, f64>,
}

#[derive(Default)]
struct Shard {
    scalars: HashMap<String, ScalarEntry>,
    counters: HashMap<String, ScalarEntry>,
    sorted_sets: HashMap<String, SortedSet>,
    claims: HashMap<String, Instant>,
}

/// In-process coordination store. Sharded by key hash to keep lock
/// contention low under the single-node concurrency model (spec.md §5).
pub struct LocalCoordinationStore {
    shards: Vec<RwLock<Shard>>,
}

const SHARD_COUNT: usize = 16;

impl LocalCoordinationStore {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(Shard::default()));
        }
        Self { shards }
    }

    fn shard_for(&self, key: &str) -> &RwLock<Shard> {
        let mut hash: u64 = 1469598103934665603; // FNV-1a offset basis
        for byte in key.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        &self.shards[(hash as usize) % self.shards.len()]
    }

    fn is_expired(entry: &ScalarEntry, now: Instant) -> bool {
        entry.expires_at.is_some_and(|at| now > at)
    }
}

impl Default for LocalCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ttl_to_expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

#[async_trait]
impl CoordinationStore for LocalCoordinationStore {
    async fn get(&self, key: &str) -> Availability<Option<Bytes>> {
        let shard = self.shard_for(key).read().await;
        let now = Instant::now();
        match shard.scalars.get(key) {
            Some(entry) if Self::is_expired(entry, now) => Availability::Known(None),
            Some(entry) => Availability::Known(Some(entry.value.clone())),
            None => Availability::Known(None),
        }
    }

    async fn set_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Availability<()> {
        let mut shard = self.shard_for(key).write().await;
        shard.scalars.insert(
            key.to_string(),
            ScalarEntry {
                value,
                expires_at: ttl_to_expiry(ttl),
            },
        );
        Availability::Known(())
    }

    async fn remove(&self, key: &str) -> Availability<()> {
        let mut shard = self.shard_for(key).write().await;
        shard.scalars.remove(key);
        shard.counters.remove(key);
        Availability::Known(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Availability<i64> {
        let mut shard = self.shard_for(key).write().await;
        let now = Instant::now();
        let current = match shard.counters.get(key) {
            Some(entry) if !Self::is_expired(entry, now) => {
                i64::from_le_bytes(entry.value.as_ref().try_into().unwrap_or_default())
            }
            _ => 0,
        };
        let next = current + delta;
        shard.counters.insert(
            key.to_string(),
            ScalarEntry {
                value: Bytes::copy_from_slice(&next.to_le_bytes()),
                expires_at: ttl_to_expiry(ttl),
            },
        );
        Availability::Known(next)
    }

    async fn peek_counter(&self, key: &str) -> Availability<i64> {
        let shard = self.shard_for(key).read().await;
        let now = Instant::now();
        match shard.counters.get(key) {
            Some(entry) if !Self::is_expired(entry, now) => {
                Availability::Known(i64::from_le_bytes(entry.value.as_ref().try_into().unwrap_or_default()))
            }
            _ => Availability::Known(0),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Availability<()> {
        let mut shard = self.shard_for(key).write().await;
        shard
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .members
            .insert(member.to_string(), score);
        Availability::Known(())
    }

    async fn zrange(
        &self,
        key: &str,
        min_score: f64,
        max_score: f64,
    ) -> Availability<Vec<(String, f64)>> {
        let shard = self.shard_for(key).read().await;
        let Some(set) = shard.sorted_sets.get(key) else {
            return Availability::Known(Vec::new());
        };
        let mut out: Vec<(String, f64)> = set
            .members
            .iter()
            .filter(|(_, score)| **score >= min_score && **score <= max_score)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        Availability::Known(out)
    }

    async fn zrem_range_by_score(&self, key: &str, min_score: f64, max_score: f64) -> Availability<()> {
        let mut shard = self.shard_for(key).write().await;
        if let Some(set) = shard.sorted_sets.get_mut(key) {
            set.members.retain(|_, score| *score < min_score || *score > max_score);
        }
        Availability::Known(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Availability<()> {
        let mut shard = self.shard_for(key).write().await;
        if let Some(set) = shard.sorted_sets.get_mut(key) {
            set.members.remove(member);
        }
        Availability::Known(())
    }

    async fn try_claim(&self, key: &str, ttl: Duration) -> Availability<bool> {
        let mut shard = self.shard_for(key).write().await;
        let now = Instant::now();
        let expired = shard.claims.get(key).is_none_or(|at| now >= *at);
        if expired {
            shard.claims.insert(key.to_string(), now + ttl);
            Availability::Known(true)
        } else {
            Availability::Known(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_accumulates_and_expires() {
        let store = LocalCoordinationStore::new();
        assert_eq!(store.incr("cost:key:1", 100, Duration::from_secs(60)).await, Availability::Known(100));
        assert_eq!(store.incr("cost:key:1", 50, Duration::from_secs(60)).await, Availability::Known(150));
    }

    #[tokio::test]
    async fn try_claim_is_exclusive_until_ttl_expires() {
        let store = LocalCoordinationStore::new();
        assert_eq!(store.try_claim("session:abc", Duration::from_secs(30)).await, Availability::Known(true));
        assert_eq!(store.try_claim("session:abc", Duration::from_secs(30)).await, Availability::Known(false));
    }

    #[tokio::test]
    async fn zrange_returns_ascending_scores() {
        let store = LocalCoordinationStore::new();
        store.zadd("lru:provider:1", "key-b", 20.0).await;
        store.zadd("lru:provider:1", "key-a", 10.0).await;
        let Availability::Known(ranked) = store.zrange("lru:provider:1", 0.0, f64::MAX).await else {
            panic!("expected known result");
        };
        assert_eq!(ranked, vec![("key-a".to_string(), 10.0), ("key-b".to_string(), 20.0)]);
    }

    #[tokio::test]
    async fn get_on_missing_key_is_known_none_not_unknown() {
        let store = LocalCoordinationStore::new();
        assert_eq!(store.get("nope").await, Availability::Known(None));
    }
}
