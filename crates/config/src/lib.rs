//! Configuration loading and validation for BigTalk.
//!
//! Loads configuration from `~/.bigtalk/config.toml` with environment
//! variable overrides. Validates all settings before handing them out.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest accepted round or tool deadline: one week.
pub const MAX_TIMEOUT_SECS: f64 = 7.0 * 24.0 * 60.0 * 60.0;

/// The root configuration structure.
///
/// Maps directly to `~/.bigtalk/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Model used by `BigTalk::request` (`provider/model`)
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Maximum generation rounds per loop invocation
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Capacity of the fragment channel between the loop task and the caller
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Per-round generation deadline in seconds (installs a timeout middleware)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_timeout_secs: Option<f64>,

    /// Per-call tool deadline in seconds (installs a tool timeout middleware)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<f64>,

    /// Extra attempts when opening a generation stream fails transiently
    #[serde(default)]
    pub generation_retries: u32,

    /// System prompt injected into every generation round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_model() -> String {
    "anthropic/claude-haiku-4-5".into()
}
fn default_max_rounds() -> u32 {
    25
}
fn default_channel_capacity() -> usize {
    64
}

impl RuntimeConfig {
    /// Load configuration from the default location with env var overrides.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_dir().join("config.toml");
        let config = Self::load_from(&path)?;
        let config = config.apply_env(|key| std::env::var(key).ok())?;
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

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BIGTALK_*` overrides using the given variable lookup.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("BIGTALK_MODEL") {
            self.default_model = model;
        }

        if let Some(rounds) = lookup("BIGTALK_MAX_ROUNDS") {
            self.max_rounds = rounds.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "BIGTALK_MAX_ROUNDS must be a positive integer, got '{rounds}'"
                ))
            })?;
        }

        if let Some(prompt) = lookup("BIGTALK_SYSTEM_PROMPT") {
            self.system_prompt = Some(prompt);
        }

        Ok(self)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".bigtalk")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "max_rounds must be at least 1".into(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be at least 1".into(),
            ));
        }

        if !self.default_model.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "default_model must look like 'provider/model', got '{}'",
                self.default_model
            )));
        }

        for (name, secs) in [
            ("round_timeout_secs", self.round_timeout_secs),
            ("tool_timeout_secs", self.tool_timeout_secs),
        ] {
            if let Some(secs) = secs
                && !(secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS)
            {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be a positive number of seconds no greater than {MAX_TIMEOUT_SECS}"
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_rounds: default_max_rounds(),
            channel_capacity: default_channel_capacity(),
            round_timeout_secs: None,
            tool_timeout_secs: None,
            generation_retries: 0,
            system_prompt: None,
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
