//! Configuration loading, validation, and management for termpilot.
//!
//! Loads configuration from `~/.termpilot/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use termpilot_core::{ApprovalPolicy, ProviderKind};

/// The root configuration structure.
///
/// Maps directly to `~/.termpilot/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the selected provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Which backend to talk to
    #[serde(default)]
    pub provider: ProviderKind,

    /// Override for the backend's base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_url: Option<String>,

    /// Model requested from the backend
    #[serde(default = "default_model")]
    pub model: String,

    /// Extra instructions appended to the built-in system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// When tool calls need user confirmation
    #[serde(default)]
    pub approval_policy: ApprovalPolicy,

    /// HTTP request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retry and backoff settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Tool execution settings
    #[serde(default)]
    pub exec: ExecConfig,

    /// Ollama generation parameters
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Hugging Face TGI generation parameters
    #[serde(default)]
    pub huggingface: HuggingFaceConfig,
}

fn default_model() -> String {
    "o4-mini".into()
}
fn default_timeout_ms() -> u64 {
    120_000
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
            .field("provider", &self.provider)
            .field("provider_url", &self.provider_url)
            .field("model", &self.model)
            .field("instructions", &self.instructions)
            .field("approval_policy", &self.approval_policy)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .field("exec", &self.exec)
            .field("ollama", &self.ollama)
            .field("huggingface", &self.huggingface)
            .finish()
    }
}

/// Retry policy for opening a response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per request, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base wait after a rate-limit error; doubles on every attempt
    #[serde(default = "default_rate_limit_wait_ms")]
    pub rate_limit_wait_ms: u64,

    /// How long to wait for the backend's model list
    #[serde(default = "default_model_list_timeout_ms")]
    pub model_list_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_rate_limit_wait_ms() -> u64 {
    2500
}
fn default_model_list_timeout_ms() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            rate_limit_wait_ms: default_rate_limit_wait_ms(),
            model_list_timeout_ms: default_model_list_timeout_ms(),
        }
    }
}

/// Shell execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Working directory for commands; defaults to the process's cwd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Default command timeout when the model does not pass one
    #[serde(default = "default_exec_timeout_ms")]
    pub timeout_ms: u64,

    /// Output kept per stream before truncation
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,
}

fn default_exec_timeout_ms() -> u64 {
    10_000
}
fn default_max_output_bytes() -> usize {
    10 * 1024
}
fn default_max_output_lines() -> usize {
    256
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            workdir: None,
            timeout_ms: default_exec_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_output_lines: default_max_output_lines(),
        }
    }
}

impl ExecConfig {
    /// The configured working directory, or the current one.
    pub fn resolved_workdir(&self) -> PathBuf {
        self.workdir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Ollama generation parameters. Every field is optional so that layers can
/// be merged: built-in defaults, then `global_params`, then per-model params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat_tau: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat_eta: Option<f32>,
    /// `-1` lets the server pick a random seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_batch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_gpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_thread: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_streaming: Option<bool>,
}

impl ModelParams {
    /// The base layer every model starts from.
    pub fn builtin_defaults() -> Self {
        Self {
            temperature: Some(0.7),
            top_p: Some(0.9),
            top_k: Some(40),
            repeat_penalty: Some(1.1),
            presence_penalty: Some(0.0),
            frequency_penalty: Some(0.0),
            mirostat: Some(0),
            mirostat_tau: Some(5.0),
            mirostat_eta: Some(0.1),
            seed: Some(-1),
            num_ctx: Some(4096),
            num_batch: Some(512),
            num_gpu: Some(1),
            num_thread: Some(4),
            stop_sequences: Some(Vec::new()),
            use_streaming: Some(true),
        }
    }

    /// Overlay `other` on top of `self`: every field set in `other` wins.
    pub fn merged_with(&self, other: &ModelParams) -> ModelParams {
        ModelParams {
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            top_k: other.top_k.or(self.top_k),
            repeat_penalty: other.repeat_penalty.or(self.repeat_penalty),
            presence_penalty: other.presence_penalty.or(self.presence_penalty),
            frequency_penalty: other.frequency_penalty.or(self.frequency_penalty),
            mirostat: other.mirostat.or(self.mirostat),
            mirostat_tau: other.mirostat_tau.or(self.mirostat_tau),
            mirostat_eta: other.mirostat_eta.or(self.mirostat_eta),
            seed: other.seed.or(self.seed),
            num_ctx: other.num_ctx.or(self.num_ctx),
            num_batch: other.num_batch.or(self.num_batch),
            num_gpu: other.num_gpu.or(self.num_gpu),
            num_thread: other.num_thread.or(self.num_thread),
            stop_sequences: other
                .stop_sequences
                .clone()
                .or_else(|| self.stop_sequences.clone()),
            use_streaming: other.use_streaming.or(self.use_streaming),
        }
    }

    pub fn streaming(&self) -> bool {
        self.use_streaming.unwrap_or(true)
    }
}

/// Per-model Ollama settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OllamaModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub params: ModelParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Parameters applied to every model
    #[serde(default)]
    pub global_params: ModelParams,

    /// Parameters for specific models, keyed by model name
    #[serde(default)]
    pub models: HashMap<String, OllamaModelConfig>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "gemma3:4b".to_string(),
            OllamaModelConfig {
                description: Some("Gemma 3 (4B), light and fast for everyday tasks".into()),
                params: ModelParams {
                    temperature: Some(0.7),
                    top_p: Some(0.9),
                    num_ctx: Some(4096),
                    ..Default::default()
                },
            },
        );
        models.insert(
            "llama3".to_string(),
            OllamaModelConfig {
                description: Some("Llama 3, general purpose development model".into()),
                params: ModelParams {
                    temperature: Some(0.8),
                    top_p: Some(0.95),
                    num_ctx: Some(8192),
                    ..Default::default()
                },
            },
        );
        models.insert(
            "codellama".to_string(),
            OllamaModelConfig {
                description: Some("CodeLlama, specialized for code".into()),
                params: ModelParams {
                    temperature: Some(0.6),
                    top_p: Some(0.95),
                    repeat_penalty: Some(1.2),
                    num_ctx: Some(16384),
                    ..Default::default()
                },
            },
        );

        Self {
            global_params: ModelParams {
                use_streaming: Some(true),
                num_thread: Some(4),
                ..Default::default()
            },
            models,
        }
    }
}

impl OllamaConfig {
    /// Effective parameters for `model`: defaults, then global, then per-model.
    pub fn params_for(&self, model: &str) -> ModelParams {
        let mut params = ModelParams::builtin_defaults().merged_with(&self.global_params);
        if let Some(model_config) = self.models.get(model) {
            params = params.merged_with(&model_config.params);
        }
        params
    }
}

/// Generation parameters for a Hugging Face text-generation-inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuggingFaceConfig {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default = "default_hf_temperature")]
    pub temperature: f32,

    #[serde(default = "default_hf_top_p")]
    pub top_p: f32,
}

fn default_max_new_tokens() -> u32 {
    1024
}
fn default_hf_temperature() -> f32 {
    0.7
}
fn default_hf_top_p() -> f32 {
    0.95
}

impl Default for HuggingFaceConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: default_hf_temperature(),
            top_p: default_hf_top_p(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.termpilot/config.toml).
    ///
    /// Environment variables override the file:
    /// - `TERMPILOT_API_KEY`, then `OPENAI_API_KEY`
    /// - `TERMPILOT_PROVIDER`, `TERMPILOT_MODEL`, `TERMPILOT_PROVIDER_URL`
    /// - `OPENAI_RATE_LIMIT_RETRY_WAIT_MS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
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

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(key) = lookup("TERMPILOT_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            if self.api_key.is_none() {
                self.api_key = Some(key);
            }
        }

        if let Some(provider) = lookup("TERMPILOT_PROVIDER") {
            self.provider = provider.parse().map_err(ConfigError::ValidationError)?;
        }

        if let Some(model) = lookup("TERMPILOT_MODEL") {
            self.model = model;
        }

        if let Some(url) = lookup("TERMPILOT_PROVIDER_URL") {
            self.provider_url = Some(url);
        }

        if let Some(wait) = lookup("OPENAI_RATE_LIMIT_RETRY_WAIT_MS") {
            self.retry.rate_limit_wait_ms = wait.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "OPENAI_RATE_LIMIT_RETRY_WAIT_MS must be an integer, got '{wait}'"
                ))
            })?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".termpilot")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError("timeout_ms must be > 0".into()));
        }

        let mut layers = vec![("global_params", &self.ollama.global_params)];
        layers.extend(
            self.ollama
                .models
                .iter()
                .map(|(name, model)| (name.as_str(), &model.params)),
        );
        for (name, params) in layers {
            if let Some(t) = params.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::ValidationError(format!(
                        "ollama temperature for {name} must be between 0.0 and 2.0"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// The base URL for the selected provider.
    pub fn base_url(&self) -> String {
        self.provider_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: ProviderKind::default(),
            provider_url: None,
            model: default_model(),
            instructions: None,
            approval_policy: ApprovalPolicy::default(),
            timeout_ms: default_timeout_ms(),
            retry: RetryConfig::default(),
            exec: ExecConfig::default(),
            ollama: OllamaConfig::default(),
            huggingface: HuggingFaceConfig::default(),
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
