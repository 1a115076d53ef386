//! Configuration loading, validation, and management for toolrelay.
//!
//! Loads configuration from `~/.toolrelay/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.toolrelay/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Tool-calling loop settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Repeated-call and error-budget thresholds
    #[serde(default)]
    pub loop_guard: LoopGuardConfig,

    /// Conversation window and execution context capacities
    #[serde(default)]
    pub context: ContextConfig,

    /// Session limits
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Debug event log bounds
    #[serde(default)]
    pub debug: DebugConfig,

    /// Free-text decision loop settings
    #[serde(default)]
    pub free_text: FreeTextConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("orchestrator", &self.orchestrator)
            .field("loop_guard", &self.loop_guard)
            .field("context", &self.context)
            .field("sessions", &self.sessions)
            .field("debug", &self.debug)
            .field("free_text", &self.free_text)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// How the orchestrator bounds its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Driven by a human in a chat; no iteration cap, loop-guarded only.
    Interactive,
    /// Unattended; capped at `max_iterations`.
    Autonomous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_mode")]
    pub mode: RunMode,

    /// Iteration cap applied in autonomous mode
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Per model call timeout
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Seeded as the first turn of every session
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_mode() -> RunMode {
    RunMode::Interactive
}
fn default_max_iterations() -> u32 {
    100
}
fn default_model_timeout_secs() -> u64 {
    60
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer \
     the user's request, then reply with a concise final answer."
        .into()
}

impl OrchestratorConfig {
    /// The iteration cap for the configured mode.
    pub fn iteration_cap(&self) -> Option<u32> {
        match self.mode {
            RunMode::Interactive => None,
            RunMode::Autonomous => Some(self.max_iterations),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_iterations: default_max_iterations(),
            model_timeout_secs: default_model_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Thresholds for repeated-call and repeated-failure detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopGuardConfig {
    /// Identical calls (including the current one) that trigger an abort
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: usize,

    /// Recent calls kept for comparison
    #[serde(default = "default_call_window")]
    pub call_window: usize,

    /// Calls older than this are forgotten
    #[serde(default = "default_call_window_secs")]
    pub call_window_secs: u64,

    /// Errors for one tool (within the error window) that trigger an abort
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,

    /// Recent errors kept for comparison
    #[serde(default = "default_error_window")]
    pub error_window: usize,
}

fn default_repeat_threshold() -> usize {
    3
}
fn default_call_window() -> usize {
    10
}
fn default_call_window_secs() -> u64 {
    120
}
fn default_error_threshold() -> usize {
    3
}
fn default_error_window() -> usize {
    5
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            repeat_threshold: default_repeat_threshold(),
            call_window: default_call_window(),
            call_window_secs: default_call_window_secs(),
            error_threshold: default_error_threshold(),
            error_window: default_error_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Turns kept per conversation (system turn included)
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Entries kept in the free-text execution context
    #[serde(default = "default_context_capacity")]
    pub capacity: usize,

    /// Entries returned for a hinted lookup
    #[serde(default = "default_hinted_limit")]
    pub hinted_limit: usize,

    /// Entries returned without a hint
    #[serde(default = "default_unhinted_limit")]
    pub unhinted_limit: usize,
}

fn default_max_turns() -> usize {
    20
}
fn default_context_capacity() -> usize {
    50
}
fn default_hinted_limit() -> usize {
    10
}
fn default_unhinted_limit() -> usize {
    20
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            capacity: default_context_capacity(),
            hinted_limit: default_hinted_limit(),
            unhinted_limit: default_unhinted_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Failed messages tolerated before a session is stopped
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
}

fn default_max_sessions() -> usize {
    5
}
fn default_max_errors() -> u32 {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_errors: default_max_errors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    #[serde(default = "default_max_flows")]
    pub max_flows: usize,
}

fn default_max_events() -> usize {
    1000
}
fn default_max_flows() -> usize {
    20
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_flows: default_max_flows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTextConfig {
    /// Pause between decisions
    #[serde(default = "default_decision_delay_ms")]
    pub decision_delay_ms: u64,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_decision_delay_ms() -> u64 {
    1000
}

impl Default for FreeTextConfig {
    fn default() -> Self {
        Self {
            decision_delay_ms: default_decision_delay_ms(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.toolrelay/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `TOOLRELAY_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("TOOLRELAY_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }

        if let Some(provider) = lookup("TOOLRELAY_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = lookup("TOOLRELAY_MODEL") {
            self.default_model = model;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolrelay")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let positive = [
            ("orchestrator.max_iterations", self.orchestrator.max_iterations as usize),
            ("orchestrator.model_timeout_secs", self.orchestrator.model_timeout_secs as usize),
            ("loop_guard.repeat_threshold", self.loop_guard.repeat_threshold),
            ("loop_guard.call_window", self.loop_guard.call_window),
            ("loop_guard.error_threshold", self.loop_guard.error_threshold),
            ("loop_guard.error_window", self.loop_guard.error_window),
            ("context.max_turns", self.context.max_turns),
            ("context.capacity", self.context.capacity),
            ("sessions.max_sessions", self.sessions.max_sessions),
            ("debug.max_events", self.debug.max_events),
            ("debug.max_flows", self.debug.max_flows),
            ("free_text.max_iterations", self.free_text.max_iterations as usize),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ValidationError(format!("{name} must be at least 1")));
        }

        if self.loop_guard.error_threshold > self.loop_guard.error_window {
            return Err(ConfigError::ValidationError(
                "loop_guard.error_threshold cannot exceed loop_guard.error_window".into(),
            ));
        }

        if self.loop_guard.repeat_threshold > self.loop_guard.call_window {
            return Err(ConfigError::ValidationError(
                "loop_guard.repeat_threshold cannot exceed loop_guard.call_window".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            orchestrator: OrchestratorConfig::default(),
            loop_guard: LoopGuardConfig::default(),
            context: ContextConfig::default(),
            sessions: SessionConfig::default(),
            debug: DebugConfig::default(),
            free_text: FreeTextConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_provider, "openrouter");
        assert_eq!(config.loop_guard.repeat_threshold, 3);
        assert_eq!(config.context.capacity, 50);
        assert_eq!(config.sessions.max_sessions, 5);
        assert_eq!(config.debug.max_events, 1000);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.orchestrator.mode, RunMode::Interactive);
        assert_eq!(parsed.free_text.decision_delay_ms, 1000);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = AppConfig::default();
        config.context.capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("context.capacity"));
    }

    #[test]
    fn error_threshold_must_fit_window() {
        let mut config = AppConfig::default();
        config.loop_guard.error_threshold = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        let config = result.unwrap();
        assert_eq!(config.default_provider, "openrouter");
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
default_model = "gpt-4o"

[orchestrator]
mode = "autonomous"
max_iterations = 7

[loop_guard]
repeat_threshold = 4

[providers.openai]
api_key = "sk-test"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.orchestrator.iteration_cap(), Some(7));
        assert_eq!(config.loop_guard.repeat_threshold, 4);
        assert_eq!(config.loop_guard.error_window, 5);
        assert_eq!(config.context.max_turns, 20);
        assert!(config.providers["openai"].api_key.is_some());
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_model = [unterminated").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn interactive_mode_has_no_cap() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.iteration_cap(), None);
    }

    #[test]
    fn env_overrides_apply_in_priority_order() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(|key| match key {
            "OPENROUTER_API_KEY" => Some("or-key".into()),
            "OPENAI_API_KEY" => Some("oa-key".into()),
            "TOOLRELAY_MODEL" => Some("gpt-4o".into()),
            _ => None,
        });
        assert_eq!(config.api_key.as_deref(), Some("or-key"));
        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.default_provider, "openrouter");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                api_key: Some("sk-other".into()),
                api_url: None,
                default_model: None,
            },
        );
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("sk-other"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openrouter"));
        assert!(toml_str.contains("[loop_guard]"));
    }
}
