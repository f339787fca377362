use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "formfuse";
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_BATCH_SIZE: i64 = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_OUTPUT: &str = "combined_forms.json";

const BATCH_SIZE_ENV: &str = "FORMFUSE_BATCH_SIZE";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[value(name = "openrouter")]
    OpenRouter,
}

impl LlmProvider {
    pub fn base_url(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-5-20250929",
            LlmProvider::OpenRouter => "anthropic/claude-sonnet-4.5",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }
}

/// What to do when a batch still fails after the last retry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Stop the run with a non-zero exit code.
    #[default]
    Abort,
    /// Emit the failed batch and every later one as unprocessed raw fields.
    ExtractOnly,
}

/// Persisted settings in the app data directory.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_provider: LlmProvider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_failure: FallbackPolicy,
}

/// Flags from the command line. `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub api_key: Option<String>,
    pub batch_size: Option<i64>,
    pub provider: Option<LlmProvider>,
    pub model: Option<String>,
    pub on_failure: Option<FallbackPolicy>,
    pub extract_only: bool,
}

#[derive(Debug, Clone)]
pub struct ReasoningSettings {
    pub provider: LlmProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub batch_size: usize,
    pub on_failure: FallbackPolicy,
    /// Absent in extract-only mode.
    pub reasoning: Option<ReasoningSettings>,
}

impl Config {
    /// Get the application data directory
    pub fn get_app_data_dir() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(APP_DIR);

        if !path.exists() {
            let _ = std::fs::create_dir_all(&path);
        }
        path
    }

    pub fn config_path() -> PathBuf {
        Self::get_app_data_dir().join(CONFIG_FILE)
    }

    pub fn load() -> Config {
        Self::load_from(&Self::config_path())
    }

    /// Missing or unparsable files yield the defaults.
    pub fn load_from(path: &Path) -> Config {
        if !path.exists() {
            return Config::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
                Config::default()
            }),
            Err(e) => {
                tracing::warn!("Cannot read config {}: {}", path.display(), e);
                Config::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ConfigFile(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::ConfigFile(format!("{}: {}", path.display(), e)))
    }

    /// Resolve run settings with precedence flag > environment > file > default.
    /// Every error here is raised before any input is opened.
    pub fn resolve(&self, overrides: &Overrides) -> Result<RunSettings, ConfigError> {
        self.resolve_with_env(overrides, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_env<F>(&self, overrides: &Overrides, env: F) -> Result<RunSettings, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_batch = match (overrides.batch_size, env(BATCH_SIZE_ENV)) {
            (Some(n), _) => n,
            (None, Some(v)) => v.trim().parse::<i64>().map_err(|_| ConfigError::InvalidEnv {
                var: BATCH_SIZE_ENV,
                value: v.clone(),
            })?,
            (None, None) => self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        };
        if raw_batch < 1 {
            return Err(ConfigError::InvalidBatchSize(raw_batch));
        }

        let on_failure = overrides.on_failure.unwrap_or(self.on_failure);

        if overrides.extract_only {
            return Ok(RunSettings {
                batch_size: raw_batch as usize,
                on_failure,
                reasoning: None,
            });
        }

        let provider = overrides.provider.unwrap_or(self.llm_provider);
        let api_key = overrides
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| env(provider.api_key_env()).filter(|k| !k.trim().is_empty()))
            .ok_or(ConfigError::MissingCredential {
                env_var: provider.api_key_env(),
            })?;

        let model = overrides
            .model
            .clone()
            .or_else(|| env("FORMFUSE_MODEL"))
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| provider.default_model().to_string());

        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| provider.base_url().to_string());

        Ok(RunSettings {
            batch_size: raw_batch as usize,
            on_failure,
            reasoning: Some(ReasoningSettings {
                provider,
                base_url,
                model,
                api_key,
                max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
                base_backoff: Duration::from_secs(1),
                request_timeout: Duration::from_secs(
                    self.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
                ),
            }),
        })
    }
}
