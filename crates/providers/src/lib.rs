//! Model provider implementations for toolrelay.
//!
//! All providers implement the `toolrelay_core::Provider` trait.
//! [`build_from_config`] picks the configured default provider.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use std::sync::Arc;
use std::time::Duration;
use toolrelay_core::{Provider, ProviderError};

/// Build the default provider from configuration.
///
/// Per-provider settings in `[providers.<name>]` win over the global key.
pub fn build_from_config(
    config: &toolrelay_config::AppConfig,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.default_provider.as_str();
    let provider_config = config.providers.get(name);

    let api_key = provider_config
        .and_then(|p| p.api_key.clone())
        .or_else(|| config.api_key.clone());

    let api_key = match (name, api_key) {
        ("ollama", key) => key.unwrap_or_else(|| "ollama".into()),
        (_, Some(key)) => key,
        (_, None) => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key for provider '{name}'"
            )));
        }
    };

    let base_url = provider_config
        .and_then(|p| p.api_url.clone())
        .or_else(|| default_base_url(name))
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!("no api_url for provider '{name}'"))
        })?;

    tracing::debug!(provider = %name, base_url = %base_url, "Building provider");

    let provider = OpenAiCompatProvider::new(name, base_url, api_key)
        .with_timeout(Duration::from_secs(config.orchestrator.model_timeout_secs));
    Ok(Arc::new(provider))
}

/// The model to request, preferring the provider's own default.
pub fn resolve_model(config: &toolrelay_config::AppConfig) -> String {
    config
        .providers
        .get(&config.default_provider)
        .and_then(|p| p.default_model.clone())
        .unwrap_or_else(|| config.default_model.clone())
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> Option<String> {
    let url = match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "ollama" => "http://localhost:11434/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "vllm" => "http://localhost:8000/v1",
        _ => return None,
    };
    Some(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolrelay_config::{AppConfig, ProviderConfig};

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("openrouter").unwrap().contains("openrouter.ai"));
        assert!(default_base_url("openai").unwrap().contains("api.openai.com"));
        assert!(default_base_url("mystery").is_none());
    }

    #[test]
    fn missing_key_is_not_configured() {
        let config = AppConfig::default();
        let err = build_from_config(&config).err().unwrap();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn build_with_global_key() {
        let config = AppConfig {
            api_key: Some("sk-test".into()),
            ..AppConfig::default()
        };
        let provider = build_from_config(&config).unwrap();
        assert_eq!(provider.name(), "openrouter");
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = AppConfig {
            default_provider: "ollama".into(),
            ..AppConfig::default()
        };
        assert!(build_from_config(&config).is_ok());
    }

    #[test]
    fn custom_provider_requires_url() {
        let mut config = AppConfig {
            default_provider: "internal".into(),
            api_key: Some("k".into()),
            ..AppConfig::default()
        };
        assert!(build_from_config(&config).is_err());

        config.providers.insert(
            "internal".into(),
            ProviderConfig {
                api_key: None,
                api_url: Some("http://models.local/v1".into()),
                default_model: Some("qwen".into()),
            },
        );
        assert!(build_from_config(&config).is_ok());
        assert_eq!(resolve_model(&config), "qwen");
    }
}
