//! `termpilot config`: configuration management commands.

use termpilot_config::AppConfig;
use termpilot_core::ProviderKind;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let warnings = config_warnings(&config);
            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Provider:  {}", config.provider);
            println!("   Base URL:  {}", config.base_url());
            println!("   Model:     {}", config.model);
            println!("   Approval:  {}", config.approval_policy);
            println!("   Workdir:   {}", config.exec.resolved_workdir().display());
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Problems that do not stop termpilot from starting but will likely break
/// a session.
pub fn config_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.provider == ProviderKind::OpenAi && !config.has_api_key() {
        warnings.push("No API key set (set OPENAI_API_KEY or TERMPILOT_API_KEY)".to_string());
    }

    if let Some(url) = &config.provider_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            warnings.push(format!("provider_url '{url}' is not an http(s) URL"));
        }
    }

    if let Some(workdir) = &config.exec.workdir {
        if !workdir.is_dir() {
            warnings.push(format!("exec.workdir {} does not exist", workdir.display()));
        }
    }

    if config.exec.timeout_ms == 0 {
        warnings.push("exec.timeout_ms is 0: every command will time out".to_string());
    }

    warnings
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.api_key.is_some() {
        config.api_key = Some("[REDACTED]".into());
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_path().display());
    Ok(())
}

pub async fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_path();
    if config_path.exists() && !force {
        println!("   Config already exists at {}", config_path.display());
        println!("   Use --force to overwrite it.");
        return Ok(());
    }

    std::fs::create_dir_all(AppConfig::config_dir())?;
    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("   ✅ Wrote {}", config_path.display());
    Ok(())
}
