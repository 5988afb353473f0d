//! `termpilot providers`: list supported LLM providers.

use termpilot_core::ProviderKind;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🤖 Supported LLM Providers");
    println!("==========================");
    println!();
    println!("{}", provider_table());
    println!();
    println!("  Environment variables:");
    println!("    OPENAI_API_KEY, TERMPILOT_API_KEY, HUGGINGFACE_API_KEY");
    println!("    TERMPILOT_PROVIDER, TERMPILOT_MODEL, TERMPILOT_PROVIDER_URL");
    println!("    OPENAI_RATE_LIMIT_RETRY_WAIT_MS");

    Ok(())
}

fn auth(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "API key",
        ProviderKind::Ollama => "None (local)",
        ProviderKind::HuggingFace => "Optional key",
    }
}

pub fn provider_table() -> String {
    let mut rows = vec![
        "  ┌──────────────┬──────────────────────────────┬──────────────┐".to_string(),
        "  │ Provider     │ Default URL                  │ Auth         │".to_string(),
        "  ├──────────────┼──────────────────────────────┼──────────────┤".to_string(),
    ];
    rows.extend(ProviderKind::ALL.iter().map(|kind| {
        format!(
            "  │ {:<12} │ {:<28} │ {:<12} │",
            kind.as_str(),
            kind.default_base_url(),
            auth(*kind)
        )
    }));
    rows.push("  └──────────────┴──────────────────────────────┴──────────────┘".to_string());
    rows.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lists_every_backend() {
        let table = provider_table();
        for kind in ProviderKind::ALL {
            assert!(table.contains(kind.as_str()));
        }
        assert!(table.contains("http://localhost:11434/api"));
    }
}
