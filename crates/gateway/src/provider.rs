//! Provider resolution and credential availability.

use std::collections::HashSet;

/// Namespace prefixes whose canonical provider tag differs from the prefix.
pub const PROVIDER_ALIASES: &[(&str, &str)] = &[("gemini", "google")];

/// Registry metadata for one provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderRegistryEntry {
    /// Canonical provider tag.
    pub name: &'static str,
    /// Environment variable holding the API key; `None` for keyless local providers.
    pub api_key_env: Option<&'static str>,
}

/// Known providers and where their credentials come from.
pub const PROVIDER_REGISTRY: &[ProviderRegistryEntry] = &[
    ProviderRegistryEntry {
        name: "openai",
        api_key_env: Some("OPENAI_API_KEY"),
    },
    ProviderRegistryEntry {
        name: "anthropic",
        api_key_env: Some("ANTHROPIC_API_KEY"),
    },
    ProviderRegistryEntry {
        name: "google",
        api_key_env: Some("GOOGLE_API_KEY"),
    },
    ProviderRegistryEntry {
        name: "openrouter",
        api_key_env: Some("OPENROUTER_API_KEY"),
    },
    ProviderRegistryEntry {
        name: "ollama",
        api_key_env: None,
    },
];

/// Looks up the registry entry for a provider tag.
pub fn registry_entry(provider: &str) -> Option<&'static ProviderRegistryEntry> {
    PROVIDER_REGISTRY.iter().find(|entry| entry.name == provider)
}

/// Resolves the canonical provider tag for a model identifier.
///
/// `gemini/gemini-2.5-pro` → `google`, `openai/gpt-4o` → `openai`,
/// a model without a namespace → `unknown`.
pub fn resolve_provider(model: &str) -> String {
    let Some((prefix, _)) = model.split_once('/') else {
        return "unknown".to_string();
    };
    PROVIDER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == prefix)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| prefix.to_string())
}

/// Returns the model name with its namespace prefix removed.
pub fn model_name(model: &str) -> &str {
    model.split_once('/').map_or(model, |(_, name)| name)
}

/// One entry of a call's try-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub identifier: String,
    pub provider: String,
}

impl ModelCandidate {
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let provider = resolve_provider(&identifier);
        Self {
            identifier,
            provider,
        }
    }
}

/// Predicate telling the executor whether a provider can be called at all.
pub trait ProviderCredentials: Send + Sync {
    fn is_provider_enabled(&self, provider: &str) -> bool;
}

/// Credentials read from the provider registry's environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl ProviderCredentials for EnvCredentials {
    fn is_provider_enabled(&self, provider: &str) -> bool {
        match registry_entry(provider) {
            Some(ProviderRegistryEntry {
                api_key_env: Some(var),
                ..
            }) => std::env::var(var).is_ok_and(|key| !key.trim().is_empty()),
            Some(ProviderRegistryEntry {
                api_key_env: None, ..
            }) => true,
            None => false,
        }
    }
}

/// Fixed allow-set of enabled providers.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    enabled: HashSet<String>,
}

impl StaticCredentials {
    pub fn new<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: providers.into_iter().map(Into::into).collect(),
        }
    }
}

impl ProviderCredentials for StaticCredentials {
    fn is_provider_enabled(&self, provider: &str) -> bool {
        self.enabled.contains(provider)
    }
}
