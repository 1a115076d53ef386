//! Subcommand implementations and the wiring they share.

pub mod chat;
pub mod config_cmd;
pub mod run;

use std::sync::Arc;
use toolrelay_config::AppConfig;
use toolrelay_core::{Provider, ProviderError, ToolCatalog};
use toolrelay_telemetry::DebugEventManager;

/// The shared collaborators every command builds on.
pub struct Runtime {
    pub config: AppConfig,
    pub provider: Arc<dyn Provider>,
    pub catalog: Arc<ToolCatalog>,
    pub debug: Arc<DebugEventManager>,
    pub model: String,
}

/// Load config and build the provider, tool catalog and debug log.
pub fn build_runtime() -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let provider = match toolrelay_providers::build_from_config(&config) {
        Ok(provider) => provider,
        Err(ProviderError::NotConfigured(reason)) => {
            print_key_help();
            return Err(format!("Provider not configured: {reason}").into());
        }
        Err(e) => return Err(e.into()),
    };

    let catalog = Arc::new(toolrelay_tools::default_catalog()?);
    let debug = Arc::new(DebugEventManager::new(
        config.debug.max_events,
        config.debug.max_flows,
    ));
    let model = toolrelay_providers::resolve_model(&config);

    Ok(Runtime {
        config,
        provider,
        catalog,
        debug,
        model,
    })
}

fn print_key_help() {
    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    OPENROUTER_API_KEY=sk-or-v1-...   (recommended)");
    eprintln!("    OPENAI_API_KEY=sk-...             (for OpenAI direct)");
    eprintln!("    TOOLRELAY_API_KEY=sk-...          (generic)");
    eprintln!();
    eprintln!("  Or add it to your config file:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
}
