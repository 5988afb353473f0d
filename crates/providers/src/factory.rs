//! Provider construction from configuration.
//!
//! Only the selected backend is ever built, so an API key is never required
//! for a backend that is not in use.

use std::time::Duration;

use termpilot_config::AppConfig;
use termpilot_core::{Provider, ProviderKind, ProviderOptions};

use crate::{HuggingFaceProvider, OllamaProvider, OpenAiProvider};

/// Build an uninitialized adapter for `kind`.
pub fn create_provider(kind: ProviderKind, config: &AppConfig) -> Box<dyn Provider> {
    match kind {
        ProviderKind::OpenAi => Box::new(OpenAiProvider::new()),
        ProviderKind::Ollama => Box::new(OllamaProvider::new(config.ollama.clone())),
        ProviderKind::HuggingFace => Box::new(HuggingFaceProvider::new(config.huggingface.clone())),
    }
}

/// Connection options for `kind`, reading keys from the process environment.
pub fn provider_options(kind: ProviderKind, config: &AppConfig) -> ProviderOptions {
    provider_options_with(kind, config, |key| std::env::var(key).ok())
}

pub fn provider_options_with(
    kind: ProviderKind,
    config: &AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> ProviderOptions {
    let api_key = match kind {
        ProviderKind::OpenAi => config.api_key.clone().or_else(|| lookup("OPENAI_API_KEY")),
        ProviderKind::HuggingFace => lookup("HUGGINGFACE_API_KEY"),
        ProviderKind::Ollama => None,
    };

    // `provider_url` belongs to the configured provider only.
    let base_url = if kind == config.provider {
        config.provider_url.clone()
    } else {
        None
    }
    .unwrap_or_else(|| kind.default_base_url().to_string());

    ProviderOptions {
        api_key,
        base_url: Some(base_url),
        timeout: Some(Duration::from_millis(config.timeout_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_the_requested_kind() {
        let config = AppConfig::default();
        for kind in ProviderKind::ALL {
            assert_eq!(create_provider(kind, &config).kind(), kind);
        }
    }

    #[test]
    fn default_base_urls() {
        let config = AppConfig::default();
        let none = |_: &str| None;
        assert_eq!(
            provider_options_with(ProviderKind::Ollama, &config, none).base_url.as_deref(),
            Some("http://localhost:11434/api")
        );
        assert_eq!(
            provider_options_with(ProviderKind::HuggingFace, &config, none).base_url.as_deref(),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn provider_url_applies_to_configured_provider_only() {
        let config = AppConfig {
            provider: ProviderKind::Ollama,
            provider_url: Some("http://gpu-box:11434/api".into()),
            ..AppConfig::default()
        };
        let none = |_: &str| None;
        assert_eq!(
            provider_options_with(ProviderKind::Ollama, &config, none).base_url.as_deref(),
            Some("http://gpu-box:11434/api")
        );
        assert_eq!(
            provider_options_with(ProviderKind::OpenAi, &config, none).base_url.as_deref(),
            Some("https://api.openai.com/v1")
        );
    }

    #[test]
    fn keys_are_scoped_per_backend() {
        let config = AppConfig {
            api_key: Some("sk-openai".into()),
            ..AppConfig::default()
        };
        let lookup = |key: &str| (key == "HUGGINGFACE_API_KEY").then(|| "hf-token".to_string());

        let openai = provider_options_with(ProviderKind::OpenAi, &config, lookup);
        let hf = provider_options_with(ProviderKind::HuggingFace, &config, lookup);
        let ollama = provider_options_with(ProviderKind::Ollama, &config, lookup);

        assert_eq!(openai.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(hf.api_key.as_deref(), Some("hf-token"));
        assert!(ollama.api_key.is_none());
        assert_eq!(openai.timeout, Some(Duration::from_millis(120_000)));
    }
}
