//! `termpilot models`: list the models a provider offers.

use termpilot_agent::ModelCatalog;
use termpilot_config::AppConfig;
use termpilot_core::ProviderKind;
use termpilot_providers::{create_provider, provider_options};

pub async fn run(provider: Option<ProviderKind>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let kind = provider.unwrap_or(config.provider);

    let mut backend = create_provider(kind, &config);
    backend
        .initialize(provider_options(kind, &config))
        .await
        .map_err(|e| format!("Failed to initialize the {kind} provider: {e}"))?;

    let catalog = ModelCatalog::new(std::time::Duration::from_millis(
        config.retry.model_list_timeout_ms,
    ));
    let available = catalog.models(backend.as_ref()).await;
    let current = (kind == config.provider).then_some(config.model.as_str());

    println!("{}", format_model_list(kind, available.as_deref(), current));
    Ok(())
}

/// Recommended models first, then whatever the backend reported.
pub fn format_model_list(kind: ProviderKind, available: Option<&[String]>, current: Option<&str>) -> String {
    let marker = |model: &str| if Some(model) == current { "*" } else { " " };

    let mut out = vec![format!("Models for {kind}"), String::new(), "  Recommended:".to_string()];
    out.extend(
        kind.recommended_models()
            .iter()
            .map(|model| format!("  {} {model}", marker(model))),
    );
    out.push(String::new());

    match available {
        None => out.push("  The backend did not answer in time.".to_string()),
        Some([]) if !kind.validates_models() => {
            out.push("  This backend serves a single model chosen by its URL.".to_string())
        }
        Some([]) => out.push("  The backend reported no models.".to_string()),
        Some(models) => {
            out.push("  Available:".to_string());
            out.extend(models.iter().map(|model| format!("  {} {model}", marker(model))));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_the_current_model() {
        let models = vec!["gpt-4.1".to_string(), "o4-mini".to_string()];
        let text = format_model_list(ProviderKind::OpenAi, Some(models.as_slice()), Some("gpt-4.1"));
        assert!(text.starts_with("Models for openai"));
        assert!(text.contains("  * gpt-4.1"));
        assert!(text.contains("    o3"));
    }

    #[test]
    fn missing_lists_are_explained() {
        let text = format_model_list(ProviderKind::Ollama, None, None);
        assert!(text.contains("did not answer in time"));

        let text = format_model_list(ProviderKind::HuggingFace, Some(&[] as &[String]), None);
        assert!(text.contains("single model"));
    }
}
