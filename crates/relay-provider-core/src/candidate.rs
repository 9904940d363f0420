//! Candidate Builder: turns the resolved provider/endpoint/key configuration
//! plus a parsed request into the ordered list of dispatch attempts the
//! Executor will try in turn.
//!
//! This module is storage-agnostic: callers (the storage snapshot layer)
//! hand in plain descriptor structs rather than sea-orm entities, keeping
//! the dependency edge pointing `relay-storage -> relay-provider-core` and
//! not back.

use std::collections::HashSet;

use crate::config::{DispatchRule, OperationKind};
use crate::credential::CredentialId;

#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub id: i64,
    pub provider_id: i64,
    pub dialect: &'static str,
}

#[derive(Debug, Clone)]
pub struct KeyDescriptor {
    pub id: CredentialId,
    pub provider_id: i64,
    pub active: bool,
    pub capabilities: Vec<String>,
    pub internal_priority: i32,
}

/// What the caller is trying to do, used to filter by allow-list and
/// dispatch-table admissibility.
#[derive(Debug, Clone)]
pub struct CandidateQuery<'a> {
    pub op: OperationKind,
    pub model: &'a str,
    pub requested_capabilities: &'a [String],
    /// `None` = no restriction (all allowed); `Some(empty)` = none allowed.
    pub allowed_providers: Option<&'a [String]>,
    pub allowed_models: Option<&'a [String]>,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: i64,
    pub provider_name: String,
    pub endpoint_id: i64,
    pub key_id: CredentialId,
    pub priority: i32,
    pub requires_transform: bool,
}

#[derive(Debug, Clone)]
pub struct SkippedCandidate {
    pub provider_id: i64,
    pub key_id: Option<CredentialId>,
    pub reason: &'static str,
}

pub struct CandidateBuilder;

/// Applies the `None = all / Some([]) = none` allow-list convention used
/// throughout candidate filtering.
fn allowed(list: Option<&[String]>, value: &str) -> bool {
    match list {
        None => true,
        Some(items) => items.iter().any(|item| item == value),
    }
}

impl CandidateBuilder {
    /// Builds the ordered-before-health-reordering candidate list: every
    /// `(provider, endpoint, key)` triple admissible for `query`, annotated
    /// with whether it needs a format conversion, in provider/key priority
    /// order, with inadmissible triples recorded as skips.
    pub fn build(
        query: &CandidateQuery<'_>,
        providers: &[ProviderDescriptor],
        endpoints: &[EndpointDescriptor],
        keys: &[KeyDescriptor],
        dispatch_rule_for: impl Fn(i64) -> DispatchRule,
    ) -> (Vec<Candidate>, Vec<SkippedCandidate>) {
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();

        for provider in providers {
            if !provider.active {
                skipped.push(SkippedCandidate {
                    provider_id: provider.id,
                    key_id: None,
                    reason: "provider_inactive",
                });
                continue;
            }
            if !allowed(query.allowed_providers, &provider.name) {
                skipped.push(SkippedCandidate {
                    provider_id: provider.id,
                    key_id: None,
                    reason: "provider_not_allowed",
                });
                continue;
            }

            let rule = dispatch_rule_for(provider.id);
            let requires_transform = match rule {
                DispatchRule::Native => false,
                DispatchRule::Transform { .. } => true,
                DispatchRule::Unsupported => {
                    skipped.push(SkippedCandidate {
                        provider_id: provider.id,
                        key_id: None,
                        reason: "op_unsupported",
                    });
                    continue;
                }
            };

            if !allowed(query.allowed_models, query.model) {
                skipped.push(SkippedCandidate {
                    provider_id: provider.id,
                    key_id: None,
                    reason: "model_not_allowed",
                });
                continue;
            }

            let provider_endpoints: Vec<&EndpointDescriptor> = endpoints
                .iter()
                .filter(|e| e.provider_id == provider.id)
                .collect();
            if provider_endpoints.is_empty() {
                skipped.push(SkippedCandidate {
                    provider_id: provider.id,
                    key_id: None,
                    reason: "no_endpoint",
                });
                continue;
            }

            let provider_keys: Vec<&KeyDescriptor> =
                keys.iter().filter(|k| k.provider_id == provider.id).collect();
            if provider_keys.is_empty() {
                skipped.push(SkippedCandidate {
                    provider_id: provider.id,
                    key_id: None,
                    reason: "no_key",
                });
                continue;
            }

            let required: HashSet<&str> =
                query.requested_capabilities.iter().map(String::as_str).collect();

            for key in provider_keys {
                if !key.active {
                    skipped.push(SkippedCandidate {
                        provider_id: provider.id,
                        key_id: Some(key.id),
                        reason: "key_inactive",
                    });
                    continue;
                }
                let have: HashSet<&str> = key.capabilities.iter().map(String::as_str).collect();
                if !required.is_subset(&have) {
                    skipped.push(SkippedCandidate {
                        provider_id: provider.id,
                        key_id: Some(key.id),
                        reason: "capability_mismatch",
                    });
                    continue;
                }
                for endpoint in &provider_endpoints {
                    candidates.push(Candidate {
                        provider_id: provider.id,
                        provider_name: provider.name.clone(),
                        endpoint_id: endpoint.id,
                        key_id: key.id,
                        priority: provider.priority * 1000 + key.internal_priority,
                        requires_transform,
                    });
                }
            }
        }

        candidates.sort_by_key(|c| c.priority);
        (candidates, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchRule;

    #[test]
    fn filters_inactive_provider_and_orders_by_priority() {
        let providers = vec![
            ProviderDescriptor { id: 1, name: "claude".into(), active: true, priority: 1 },
            ProviderDescriptor { id: 2, name: "openai".into(), active: false, priority: 0 },
        ];
        let endpoints = vec![EndpointDescriptor { id: 10, provider_id: 1, dialect: "claude" }];
        let keys = vec![KeyDescriptor {
            id: 100,
            provider_id: 1,
            active: true,
            capabilities: vec!["vision".into()],
            internal_priority: 0,
        }];
        let query = CandidateQuery {
            op: OperationKind::ClaudeGenerate,
            model: "claude-3",
            requested_capabilities: &["vision".to_string()],
            allowed_providers: None,
            allowed_models: None,
        };
        let (candidates, skipped) =
            CandidateBuilder::build(&query, &providers, &endpoints, &keys, |_| DispatchRule::Native);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_id, 1);
        assert!(skipped.iter().any(|s| s.provider_id == 2 && s.reason == "provider_inactive"));
    }

    #[test]
    fn empty_allowed_models_means_none_allowed() {
        let providers = vec![ProviderDescriptor { id: 1, name: "claude".into(), active: true, priority: 0 }];
        let endpoints = vec![EndpointDescriptor { id: 10, provider_id: 1, dialect: "claude" }];
        let keys = vec![KeyDescriptor {
            id: 100,
            provider_id: 1,
            active: true,
            capabilities: vec![],
            internal_priority: 0,
        }];
        let empty: Vec<String> = Vec::new();
        let query = CandidateQuery {
            op: OperationKind::ClaudeGenerate,
            model: "claude-3",
            requested_capabilities: &[],
            allowed_providers: None,
            allowed_models: Some(&empty),
        };
        let (candidates, _) =
            CandidateBuilder::build(&query, &providers, &endpoints, &keys, |_| DispatchRule::Native);
        assert!(candidates.is_empty());
    }
}
