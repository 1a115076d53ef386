//! `toolrelay config`: Configuration management commands.

use toolrelay_config::AppConfig;

const REDACTED: &str = "<redacted>";

pub fn print_default() {
    print!("{}", AppConfig::default_toml());
}

pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", toml::to_string_pretty(&redacted(config))?);
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

pub fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    // load() already runs validate() on the file contents
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   Config parsed and validated");

    if !config.has_api_key() && config.default_provider != "ollama" {
        println!("   Warning: no API key set (OPENROUTER_API_KEY, OPENAI_API_KEY or TOOLRELAY_API_KEY)");
    }

    println!();
    println!("   Provider:    {}", config.default_provider);
    println!("   Model:       {}", config.default_model);
    println!(
        "   Mode:        {:?} (cap {})",
        config.orchestrator.mode,
        config
            .orchestrator
            .iteration_cap()
            .map_or_else(|| "none".to_string(), |cap| cap.to_string())
    );
    println!(
        "   Loop guard:  {} repeats / {} errors in last {}",
        config.loop_guard.repeat_threshold,
        config.loop_guard.error_threshold,
        config.loop_guard.error_window
    );
    println!("   Sessions:    max {}", config.sessions.max_sessions);
    Ok(())
}

fn redacted(mut config: AppConfig) -> AppConfig {
    if config.api_key.is_some() {
        config.api_key = Some(REDACTED.into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(REDACTED.into());
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_hides_every_key() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-secret".into());
        let mut provider: toolrelay_config::ProviderConfig =
            toml::from_str(r#"api_key = "sk-other""#).unwrap();
        provider.api_url = Some("http://localhost:8080/v1".into());
        config.providers.insert("custom".into(), provider);

        let shown = toml::to_string_pretty(&redacted(config)).unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(!shown.contains("sk-other"));
        assert!(shown.contains(REDACTED));
        assert!(shown.contains("localhost:8080"));
    }
}
