use relay_provider_core::ProviderRegistry;

use crate::builtin::builtin_provider_seeds;

/// Populates a [`ProviderRegistry`] with every builtin provider.
///
/// Operator-configured providers that reuse a builtin's wire behaviour (e.g. a
/// second OpenAI-compatible endpoint) are expected to register under the
/// `custom` name; this function only wires the fixed set shipped in this crate.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    for seed in builtin_provider_seeds() {
        registry.register((seed.build)());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_builtin_name() {
        let mut registry = ProviderRegistry::new();
        register_builtin_providers(&mut registry);
        for seed in builtin_provider_seeds() {
            assert!(registry.get(seed.name).is_some(), "missing {}", seed.name);
        }
    }
}
