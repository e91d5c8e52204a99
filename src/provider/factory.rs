// Aglogen Assistant — Provider factory

use std::collections::HashMap;

use super::{AIProvider, AnthropicProvider, OpenAICompatibleProvider};

pub const SUPPORTED_PROVIDERS: [&str; 4] = ["anthropic", "openai", "groq", "xai"];

/// Human-readable provider name.
pub fn provider_display(provider_name: &str) -> Option<&'static str> {
    match provider_name {
        "anthropic" => Some("Anthropic (Claude)"),
        "openai" => Some("OpenAI (GPT)"),
        "groq" => Some("Groq"),
        "xai" => Some("xAI (Grok)"),
        _ => None,
    }
}

/// Builds providers by name. Base URLs can be overridden per provider, for
/// self-hosted gateways.
#[derive(Debug, Clone, Default)]
pub struct ProviderFactory {
    api_bases: HashMap<String, String>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_bases(api_bases: HashMap<String, String>) -> Self {
        Self { api_bases }
    }

    pub fn supported_providers() -> Vec<&'static str> {
        SUPPORTED_PROVIDERS.to_vec()
    }

    pub fn create_provider(
        &self,
        provider_name: &str,
        api_key: &str,
        model_name: &str,
    ) -> anyhow::Result<Box<dyn AIProvider>> {
        let api_base = self.api_bases.get(provider_name).map(String::as_str);
        tracing::info!(
            provider = %provider_name,
            model = %model_name,
            api_base = %api_base.unwrap_or("(default)"),
            "Creating LLM provider"
        );

        match provider_name {
            "anthropic" => Ok(Box::new(AnthropicProvider::new(api_key, model_name, api_base)?)),
            "openai" | "groq" | "xai" => Ok(Box::new(OpenAICompatibleProvider::new(
                provider_name,
                api_key,
                model_name,
                api_base,
            )?)),
            other => anyhow::bail!(
                "Unknown provider: {}. Supported: {}",
                other,
                SUPPORTED_PROVIDERS.join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_providers() {
        let factory = ProviderFactory::new();
        for name in SUPPORTED_PROVIDERS {
            let provider = factory.create_provider(name, "key", "model-x").unwrap();
            assert_eq!(provider.provider_name(), name);
            assert_eq!(provider.model_name(), "model-x");
            assert_eq!(provider.model_info()["provider"], name);
        }
    }

    #[test]
    fn test_every_provider_has_display_name() {
        assert!(SUPPORTED_PROVIDERS.iter().all(|p| provider_display(p).is_some()));
        assert_eq!(provider_display("xai"), Some("xAI (Grok)"));
        assert_eq!(provider_display("mistral"), None);
    }

    #[test]
    fn test_unknown_provider() {
        let err = ProviderFactory::new()
            .create_provider("mistral", "key", "m")
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Unknown provider: mistral. Supported: anthropic, openai, groq, xai"
        );
    }
}
