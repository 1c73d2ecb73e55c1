//! Configuration loading and defaults for openclaude.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_MAX_STEPS: u32 = 100;

// === Types ===

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // NaN or negative values from a bad config collapse to zero.
        let delay = if delay.is_nan() { 0.0 } else { delay.clamp(0.0, 300.0) };
        std::time::Duration::from_secs_f64(delay)
    }
}

/// Resolved configuration, including profile and environment overrides.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub max_steps: Option<u32>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    ///
    /// A missing file is not an error: defaults plus the environment still apply.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = path.map(expand_pathbuf).or_else(default_config_path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => load_config_file(path, profile)?,
            _ => {
                if let Some(name) = profile {
                    anyhow::bail!("Profile '{name}' not found. Available profiles: none");
                }
                Config::default()
            }
        };

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Validate fields that would otherwise fail later in confusing ways.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("api_key cannot be empty string");
        }
        if let Some(ref url) = self.base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            anyhow::bail!("base_url must start with http:// or https://, got '{url}'");
        }
        if let Some(ref model) = self.model
            && model.trim().is_empty()
        {
            anyhow::bail!("model cannot be empty string");
        }
        if self.max_tokens == Some(0) {
            anyhow::bail!("max_tokens must be greater than zero");
        }
        if self.max_steps == Some(0) {
            anyhow::bail!("max_steps must be greater than zero");
        }
        if let Some(retry) = &self.retry {
            for (name, value) in [
                ("retry.initial_delay", retry.initial_delay),
                ("retry.max_delay", retry.max_delay),
                ("retry.exponential_base", retry.exponential_base),
            ] {
                if let Some(value) = value
                    && !(value.is_finite() && value >= 0.0)
                {
                    anyhow::bail!("{name} must be a non-negative number, got {value}");
                }
            }
        }
        Ok(())
    }

    /// Base URL of the chat-completions service, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    /// Read the API key, environment first.
    pub fn api_key(&self) -> Result<String> {
        if let Some(key) = env_value(&["OPENCLAUDE_API_KEY", "API_KEY"]) {
            return Ok(key);
        }
        if let Some(configured) = self.api_key.clone()
            && !configured.trim().is_empty()
        {
            return Ok(configured);
        }
        anyhow::bail!(
            "API key not found. Set it using one of these methods:\n\
             1. Set OPENCLAUDE_API_KEY (or API_KEY) in the environment or a .env file\n\
             2. Add 'api_key = \"your-key\"' to ~/.openclaude/config.toml"
        )
    }

    #[must_use]
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    #[must_use]
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    #[must_use]
    pub fn max_steps(&self) -> u32 {
        self.max_steps.unwrap_or(DEFAULT_MAX_STEPS)
    }

    /// Resolve the effective retry policy with defaults applied.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

// === Defaults ===

fn default_config_path() -> Option<PathBuf> {
    env_config_path().or_else(home_config_path)
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".openclaude").join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    std::env::var("OPENCLAUDE_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(|path| expand_path(&path))
}

fn expand_pathbuf(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(raw) => expand_path(raw),
        None => path,
    }
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

// === Environment Overrides ===

/// First non-empty value among the given variables.
fn env_value(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(value) = env_value(&["OPENCLAUDE_API_KEY", "API_KEY"]) {
        config.api_key = Some(value);
    }
    if let Some(value) = env_value(&["OPENCLAUDE_BASE_URL", "BASE_URL"]) {
        config.base_url = Some(value);
    }
    if let Some(value) = env_value(&["OPENCLAUDE_MODEL", "MODEL_NAME"]) {
        config.model = Some(value);
    }
    if let Some(value) = env_value(&["OPENCLAUDE_MAX_STEPS"])
        && let Ok(parsed) = value.trim().parse::<u32>()
    {
        config.max_steps = Some(parsed);
    }
}

// === Profiles ===

fn load_config_file(path: &Path, profile: Option<&str>) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let parsed: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    apply_profile(parsed, profile)
}

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    keys.join(", ")
                })
                .filter(|keys| !keys.is_empty())
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
        }
    }
}

fn merge_config(base: Config, override_cfg: Config) -> Config {
    Config {
        api_key: override_cfg.api_key.or(base.api_key),
        base_url: override_cfg.base_url.or(base.base_url),
        model: override_cfg.model.or(base.model),
        max_tokens: override_cfg.max_tokens.or(base.max_tokens),
        max_steps: override_cfg.max_steps.or(base.max_steps),
        retry: override_cfg.retry.or(base.retry),
    }
}
