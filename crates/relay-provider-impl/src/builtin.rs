//! Static seed list of the providers this binary ships with.
//!
//! The storage layer persists operator-configured `Provider`/`Key` rows;
//! this module only supplies the fixed `UpstreamProvider` behaviour each
//! known provider name dispatches to.

use std::sync::Arc;

use relay_provider_core::UpstreamProvider;

use crate::providers::{
    AIStudioProvider, AntigravityProvider, ClaudeCodeProvider, ClaudeProvider, CodexProvider,
    CustomProvider, DeepSeekProvider, GeminiCliProvider, NvidiaProvider, OpenAIProvider,
    VertexExpressProvider, VertexProvider,
};

/// One builtin provider's name paired with a constructor for its behaviour.
pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub build: fn() -> Arc<dyn UpstreamProvider>,
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        BuiltinProviderSeed {
            name: "claude",
            build: || Arc::new(ClaudeProvider),
        },
        BuiltinProviderSeed {
            name: "claudecode",
            build: || Arc::new(ClaudeCodeProvider),
        },
        BuiltinProviderSeed {
            name: "openai",
            build: || Arc::new(OpenAIProvider),
        },
        BuiltinProviderSeed {
            name: "aistudio",
            build: || Arc::new(AIStudioProvider),
        },
        BuiltinProviderSeed {
            name: "vertex",
            build: || Arc::new(VertexProvider),
        },
        BuiltinProviderSeed {
            name: "vertexexpress",
            build: || Arc::new(VertexExpressProvider),
        },
        BuiltinProviderSeed {
            name: "geminicli",
            build: || Arc::new(GeminiCliProvider),
        },
        BuiltinProviderSeed {
            name: "codex",
            build: || Arc::new(CodexProvider),
        },
        BuiltinProviderSeed {
            name: "antigravity",
            build: || Arc::new(AntigravityProvider),
        },
        BuiltinProviderSeed {
            name: "nvidia",
            build: || Arc::new(NvidiaProvider),
        },
        BuiltinProviderSeed {
            name: "deepseek",
            build: || Arc::new(DeepSeekProvider),
        },
        BuiltinProviderSeed {
            name: "custom",
            build: || Arc::new(CustomProvider),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_names_are_unique() {
        let seeds = builtin_provider_seeds();
        let mut names: Vec<&str> = seeds.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), seeds.len());
    }

    #[test]
    fn every_seed_builds_and_reports_its_own_name() {
        for seed in builtin_provider_seeds() {
            let provider = (seed.build)();
            assert_eq!(provider.name(), seed.name);
        }
    }
}
