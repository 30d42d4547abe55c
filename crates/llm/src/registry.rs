use std::collections::BTreeMap;
use std::sync::Arc;

use super::provider::{ProviderConfig, ProviderError, ProviderFactory, ProviderResult};
use super::rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigOpenAiFactory};

/// A provider kind bound to a user-facing name together with its non-secret config.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub name: String,
    pub factory: Arc<dyn ProviderFactory>,
    pub base_config: ProviderConfig,
}

/// Name to provider lookup table, built once during composition.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the rig-backed OpenAI-compatible provider under its usual names.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let factory: Arc<dyn ProviderFactory> = Arc::new(RigOpenAiFactory);
        for name in [RIG_OPENAI_PROVIDER_ID, "rig-openai", "openai-compatible"] {
            registry.register(name, factory.clone(), ProviderConfig::new(name));
        }
        registry
    }

    /// Binds `name` to `factory`, replacing any previous binding.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn ProviderFactory>,
        base_config: ProviderConfig,
    ) {
        let name = normalize_name(&name.into());
        tracing::debug!(provider = %name, factory = %factory.id(), "registered chat provider");
        self.entries.insert(
            name.clone(),
            RegisteredProvider {
                name,
                factory,
                base_config,
            },
        );
    }

    pub fn resolve(&self, name: &str) -> ProviderResult<&RegisteredProvider> {
        let normalized = normalize_name(name);
        self.entries
            .get(&normalized)
            .ok_or_else(|| ProviderError::UnsupportedProvider {
                stage: "registry-resolve",
                provider_id: normalized,
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&normalize_name(name))
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_aliases_case_insensitively() {
        let registry = ProviderRegistry::with_builtin();
        assert!(registry.contains("OpenAI"));
        assert!(registry.contains("openai-compatible"));

        let entry = registry.resolve(" rig-openai ").unwrap();
        assert_eq!(entry.name, "rig-openai");
        assert_eq!(entry.factory.id(), RIG_OPENAI_PROVIDER_ID);
    }

    #[test]
    fn unknown_providers_are_rejected() {
        let registry = ProviderRegistry::with_builtin();
        let error = registry.resolve("cloudflare").err().unwrap();
        assert!(matches!(
            error,
            ProviderError::UnsupportedProvider { ref provider_id, .. } if provider_id == "cloudflare"
        ));
    }
}
