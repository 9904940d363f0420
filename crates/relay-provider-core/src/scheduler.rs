//! Scheduler: groups and orders the Candidate Builder's flat candidate list
//! according to the operator's chosen strategy, then hands each provider's
//! slice to the Pool Manager for health-based reordering.

use std::collections::BTreeMap;

use relay_common::{SchedulerConfig, SchedulerMode};

use crate::candidate::Candidate;

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Groups candidates per the configured mode. `provider_first` preserves
    /// provider priority groups (exhaust one provider's keys before moving
    /// to the next); `global_key_first` flattens into one priority-ordered
    /// list spanning all providers, so a high-priority key on a lower-
    /// priority provider can still be tried before a low-priority key on a
    /// higher-priority provider.
    pub fn order(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        match self.config.mode {
            SchedulerMode::ProviderFirst => {
                let mut grouped: BTreeMap<i64, Vec<Candidate>> = BTreeMap::new();
                let mut provider_order = Vec::new();
                for candidate in candidates {
                    if !grouped.contains_key(&candidate.provider_id) {
                        provider_order.push(candidate.provider_id);
                    }
                    grouped.entry(candidate.provider_id).or_default().push(candidate);
                }
                provider_order.sort_by_key(|id| {
                    grouped[id].iter().map(|c| c.priority).min().unwrap_or(i32::MAX)
                });
                provider_order
                    .into_iter()
                    .flat_map(|id| grouped.remove(&id).unwrap_or_default())
                    .collect()
            }
            SchedulerMode::GlobalKeyFirst => {
                let mut ordered = candidates;
                ordered.sort_by_key(|c| (c.priority, c.key_id));
                ordered
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(provider_id: i64, key_id: i64, priority: i32) -> Candidate {
        Candidate {
            provider_id,
            provider_name: format!("provider-{provider_id}"),
            endpoint_id: 1,
            key_id,
            priority,
            requires_transform: false,
        }
    }

    #[test]
    fn provider_first_keeps_a_providers_keys_contiguous() {
        let scheduler = Scheduler::new(SchedulerConfig {
            mode: SchedulerMode::ProviderFirst,
            ..Default::default()
        });
        let ordered = scheduler.order(vec![
            candidate(2, 20, 50),
            candidate(1, 10, 100),
            candidate(1, 11, 101),
            candidate(2, 21, 51),
        ]);
        let provider_sequence: Vec<i64> = ordered.iter().map(|c| c.provider_id).collect();
        assert_eq!(provider_sequence, vec![2, 2, 1, 1]);
    }

    #[test]
    fn global_key_first_flattens_by_priority() {
        let scheduler = Scheduler::new(SchedulerConfig {
            mode: SchedulerMode::GlobalKeyFirst,
            ..Default::default()
        });
        let ordered = scheduler.order(vec![candidate(1, 10, 100), candidate(2, 20, 50)]);
        assert_eq!(ordered[0].provider_id, 2);
        assert_eq!(ordered[1].provider_id, 1);
    }
}
