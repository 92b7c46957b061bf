use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::api::EffortLevel;
use crate::gate::GatePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    // Research backend (LangGraph dev server or deployment)
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_reasoning_model")]
    pub reasoning_model: String,
    #[serde(default)]
    pub effort: EffortLevel,

    // Stream retry behaviour
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub retry_backoff_exponential: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Streaming-preview gate
    #[serde(default)]
    pub gate_policy: GatePolicy,
    #[serde(default = "default_gate_min_length")]
    pub gate_min_length: usize,

    // Research history cache
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_base_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_reasoning_model() -> String {
    "gemini-2.0-flash-exp".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_gate_min_length() -> usize {
    80
}

fn default_database_path() -> String {
    "locaith_research.db".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            reasoning_model: default_reasoning_model(),
            effort: EffortLevel::default(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_backoff_exponential: false,
            request_timeout_secs: default_request_timeout_secs(),
            gate_policy: GatePolicy::default(),
            gate_min_length: default_gate_min_length(),
            database_path: default_database_path(),
        }
    }
}

impl ClientConfig {
    /// Path to the config file under the platform config directory.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("locaith")
            .join("client.toml")
    }

    /// Load config from client.toml, falling back to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<ClientConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::debug!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to the platform config directory.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {:?}", parent))?;
        }

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LOCAITH_BASE_URL") {
            if !url.trim().is_empty() {
                config.base_url = url;
            }
        }

        if let Ok(model) = env::var("LOCAITH_REASONING_MODEL") {
            if !model.trim().is_empty() {
                config.reasoning_model = model;
            }
        }

        if let Ok(effort) = env::var("LOCAITH_EFFORT") {
            match effort.to_lowercase().as_str() {
                "low" => config.effort = EffortLevel::Low,
                "medium" => config.effort = EffortLevel::Medium,
                "high" => config.effort = EffortLevel::High,
                other => tracing::warn!("Unknown effort level {other:?}, keeping default"),
            }
        }

        if let Ok(retries) = env::var("LOCAITH_MAX_RETRIES") {
            if let Ok(count) = retries.parse() {
                config.max_retries = count;
            }
        }

        if let Ok(delay) = env::var("LOCAITH_RETRY_BASE_DELAY_MS") {
            if let Ok(millis) = delay.parse() {
                config.retry_base_delay_ms = millis;
            }
        }

        if let Ok(enabled) = env::var("LOCAITH_RETRY_BACKOFF_EXPONENTIAL") {
            let enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
            config.retry_backoff_exponential = enabled;
        }

        if let Ok(timeout) = env::var("LOCAITH_REQUEST_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.request_timeout_secs = seconds;
            }
        }

        if let Ok(policy) = env::var("LOCAITH_GATE_POLICY") {
            match policy.to_lowercase().as_str() {
                "always" => config.gate_policy = GatePolicy::Always,
                "min_length" => config.gate_policy = GatePolicy::MinLength,
                "heuristic" => config.gate_policy = GatePolicy::Heuristic,
                other => tracing::warn!("Unknown gate policy {other:?}, keeping default"),
            }
        }

        if let Ok(length) = env::var("LOCAITH_GATE_MIN_LENGTH") {
            if let Ok(chars) = length.parse() {
                config.gate_min_length = chars;
            }
        }

        if let Ok(path) = env::var("LOCAITH_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        config
    }
}
