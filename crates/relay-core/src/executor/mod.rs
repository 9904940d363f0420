//! Executor: runs a request over an ordered credential list, attempt by
//! attempt, handing each attempt's outcome back to the caller for
//! failover/cooldown decisions (spec.md §4.8). The order itself comes from
//! the Candidate Builder + Scheduler (§4.6, §4.7) instead of the pool's raw
//! insertion order; `relay_provider_core::pool::PoolManager` still does the
//! health/cooldown/cache-affinity reordering on top, same as before.

pub mod stream_tracker;

use relay_provider_core::candidate::{
    Candidate, CandidateBuilder, CandidateQuery, EndpointDescriptor, KeyDescriptor,
    ProviderDescriptor,
};
use relay_provider_core::config::{DispatchRule, OperationKind};
use relay_provider_core::{CredentialId, Scheduler};
use relay_storage::{CredentialRow, ProviderRow};

fn json_priority(value: &serde_json::Value, key: &str) -> i32 {
    value
        .get(key)
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .unwrap_or(0)
}

/// Resolves the priority order a single provider's credentials should be
/// tried in for one request: the Candidate Builder filters/ranks them, the
/// Scheduler applies the operator's provider-first/global-key-first mode
/// (spec.md §4.7). `rule` is the dispatch outcome already resolved for this
/// provider/operation (native vs. needs-transform) -- the caller has it in
/// hand, so there's no need to thread a whole dispatch table through here.
///
/// Single-provider only: `relay-router` resolves exactly one provider
/// before `relay-core` ever sees the request, so "cross-provider candidate
/// enumeration" (§4.6) collapses to ranking one provider's own keys. The
/// result is still computed from `CandidateBuilder`/`Scheduler`, not a
/// bypass of them, and a multi-provider caller could pass several
/// single-element `providers` slices through the same builder call.
pub fn order_credentials(
    provider: &ProviderRow,
    credentials: &[CredentialRow],
    model: &str,
    rule: DispatchRule,
    scheduler: &relay_common::SchedulerConfig,
) -> Vec<CredentialId> {
    let providers = [ProviderDescriptor {
        id: provider.id,
        name: provider.name.clone(),
        active: provider.enabled,
        priority: json_priority(&provider.config_json, "priority"),
    }];
    let endpoints = [EndpointDescriptor {
        id: provider.id,
        provider_id: provider.id,
        dialect: "native",
    }];
    let keys: Vec<KeyDescriptor> = credentials
        .iter()
        .filter(|c| c.provider_id == provider.id)
        .map(|c| KeyDescriptor {
            id: c.id,
            provider_id: c.provider_id,
            active: c.enabled,
            capabilities: Vec::new(),
            internal_priority: json_priority(&c.settings_json, "priority"),
        })
        .collect();

    let query = CandidateQuery {
        // Unused by `CandidateBuilder::build` beyond being carried on the
        // query (the dispatch rule below already encodes admissibility for
        // this operation); kept populated for callers that inspect `query`.
        op: OperationKind::Usage,
        model,
        requested_capabilities: &[],
        allowed_providers: None,
        allowed_models: None,
    };

    let (candidates, _skipped) =
        CandidateBuilder::build(&query, &providers, &endpoints, &keys, |_id| rule);
    let ordered = Scheduler::new(scheduler.clone()).order(candidates);
    ordered.into_iter().map(|c: Candidate| c.key_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn provider(id: i64, priority_json: Option<i32>) -> ProviderRow {
        let config_json = match priority_json {
            Some(p) => serde_json::json!({ "priority": p }),
            None => serde_json::json!({}),
        };
        ProviderRow {
            id,
            name: format!("provider-{id}"),
            config_json,
            enabled: true,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn credential(id: i64, provider_id: i64, priority: i32) -> CredentialRow {
        CredentialRow {
            id,
            provider_id,
            name: None,
            settings_json: serde_json::json!({ "priority": priority }),
            secret_json: serde_json::json!({}),
            enabled: true,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn orders_credentials_by_internal_priority() {
        let p = provider(1, None);
        let creds = vec![credential(10, 1, 5), credential(11, 1, 1), credential(12, 1, 3)];
        let order = order_credentials(
            &p,
            &creds,
            "claude-3",
            DispatchRule::Native,
            &relay_common::SchedulerConfig::default(),
        );
        assert_eq!(order, vec![11, 12, 10]);
    }

    #[test]
    fn disabled_credentials_are_excluded() {
        let p = provider(1, None);
        let mut disabled = credential(10, 1, 0);
        disabled.enabled = false;
        let creds = vec![disabled, credential(11, 1, 1)];
        let order = order_credentials(
            &p,
            &creds,
            "claude-3",
            DispatchRule::Native,
            &relay_common::SchedulerConfig::default(),
        );
        assert_eq!(order, vec![11]);
    }
}
