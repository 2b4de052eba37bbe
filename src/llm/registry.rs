//! Provider registry: explicit name → constructor mapping.
//!
//! The provider is chosen by configuration, resolved once at startup.
//! Unknown names fail fast with a configuration error so a typo can never
//! silently select a different backend.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::LlmConfig;

use super::{LlmClient, LlmError, OpenAiCompatClient};

/// Constructor for one registered provider.
pub type ProviderFactory =
    Box<dyn Fn(&LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync>;

/// Name-keyed provider constructors.
pub struct ProviderRegistry {
    factories: FxHashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Empty registry; use [`ProviderRegistry::with_defaults`] for the
    /// shipped providers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Registry pre-populated with the built-in `openai-compatible`
    /// provider.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("openai-compatible", |config| {
            Ok(Arc::new(OpenAiCompatClient::new(config.clone())?) as Arc<dyn LlmClient>)
        });
        registry
    }

    /// Register (or replace) a provider constructor under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Resolve the provider named in `config`. Unknown names are a
    /// configuration error.
    pub fn resolve(&self, config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
        let factory = self.factories.get(&config.provider).ok_or_else(|| {
            LlmError::Configuration(format!(
                "unknown llm provider '{}' (registered: {})",
                config.provider,
                self.names().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
