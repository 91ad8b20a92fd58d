//! Engine configuration: named tunables with documented defaults, loaded
//! from TOML with environment overrides. Business parameters (idle
//! threshold, blend weight) are configuration, never inferred constants.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// --- env defaults & names ---
pub const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";
pub const DEFAULT_MODEL_CONFIG_PATH: &str = "config/model.json";

pub const ENV_CONFIG_PATH: &str = "NBA_CONFIG_PATH";
pub const ENV_IDLE_THRESHOLD: &str = "NBA_IDLE_THRESHOLD_SECS";
pub const ENV_LLM_WEIGHT: &str = "NBA_LLM_WEIGHT";
pub const ENV_BATCH_WORKERS: &str = "NBA_BATCH_WORKERS";

fn default_idle_threshold_secs() -> u64 {
    1800 // 30 minutes between records closes a thread
}
fn default_clock_skew_secs() -> u64 {
    300
}
fn default_min_text_len() -> usize {
    1
}
fn default_max_text_len() -> usize {
    1000
}
fn default_dormant_after_hours() -> i64 {
    24
}
fn default_active_window_hours() -> i64 {
    24
}
fn default_llm_weight() -> f32 {
    0.3
}
fn default_llm_timeout_secs() -> u64 {
    4
}
fn default_llm_max_retries() -> u32 {
    2
}
fn default_llm_backoff_ms() -> u64 {
    250
}
fn default_batch_workers() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Gap (seconds) beyond which a new conversation thread starts.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    /// How far in the future a record timestamp may lie and still pass.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    /// Hours without activity after which an open thread counts as dormant.
    #[serde(default = "default_dormant_after_hours")]
    pub dormant_after_hours: i64,
    /// Recency window (hours) for the "customer very active" rule.
    #[serde(default = "default_active_window_hours")]
    pub active_window_hours: i64,
    /// Blend weight for model confidence in the merger, in [0, 1].
    #[serde(default = "default_llm_weight")]
    pub llm_weight: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default = "default_llm_backoff_ms")]
    pub llm_backoff_ms: u64,
    /// Bounded batch concurrency; 1 means sequential execution.
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold_secs(),
            clock_skew_secs: default_clock_skew_secs(),
            min_text_len: default_min_text_len(),
            max_text_len: default_max_text_len(),
            dormant_after_hours: default_dormant_after_hours(),
            active_window_hours: default_active_window_hours(),
            llm_weight: default_llm_weight(),
            llm_timeout_secs: default_llm_timeout_secs(),
            llm_max_retries: default_llm_max_retries(),
            llm_backoff_ms: default_llm_backoff_ms(),
            batch_workers: default_batch_workers(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading engine config from {}", path.as_ref().display()))?;
        let mut cfg: EngineConfig = toml::from_str(&data).context("parsing engine config TOML")?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Resolution order: $NBA_CONFIG_PATH, then `config/engine.toml`,
    /// then built-in defaults. Env overrides apply on top either way.
    pub fn load_default() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = match Self::load_from_file(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::debug!(%path, error = %err, "engine config not loaded; using defaults");
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        cfg.sanitize();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env::<u64>(ENV_IDLE_THRESHOLD) {
            self.idle_threshold_secs = v;
        }
        if let Some(v) = parse_env::<f32>(ENV_LLM_WEIGHT) {
            self.llm_weight = v;
        }
        if let Some(v) = parse_env::<usize>(ENV_BATCH_WORKERS) {
            self.batch_workers = v;
        }
    }

    fn sanitize(&mut self) {
        self.llm_weight = self.llm_weight.clamp(0.0, 1.0);
        if self.idle_threshold_secs == 0 {
            self.idle_threshold_secs = default_idle_threshold_secs();
        }
        if self.batch_workers == 0 {
            self.batch_workers = 1;
        }
        if self.max_text_len == 0 {
            self.max_text_len = default_max_text_len();
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Model-collaborator config, loaded from `config/model.json`.
/// `api_key = "ENV"` means: resolve from OPENAI_API_KEY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub enabled: bool,
    /// "openai" (case-insensitive); anything else means no collaborator.
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

fn default_api_key() -> String {
    "ENV".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: String::new(),
            model: None,
            api_key: default_api_key(),
        }
    }
}

impl ModelConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading model config from {}", path.as_ref().display()))?;
        let mut cfg: ModelConfig = serde_json::from_str(&data).context("parsing model config")?;
        cfg.provider = cfg.provider.to_lowercase();
        Ok(cfg)
    }

    /// Missing file is a normal condition: the engine runs degraded.
    pub fn load_default() -> Self {
        match Self::load_from_file(DEFAULT_MODEL_CONFIG_PATH) {
            Ok(cfg) => cfg,
            Err(_) => Self::default(),
        }
    }

    /// Resolve the API key, honoring the "ENV" indirection.
    pub fn resolved_api_key(&self) -> Option<String> {
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())
        } else if self.api_key.trim().is_empty() {
            None
        } else {
            Some(self.api_key.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.idle_threshold_secs, 1800);
        assert_eq!(cfg.clock_skew_secs, 300);
        assert!((cfg.llm_weight - 0.3).abs() < 1e-6);
        assert_eq!(cfg.llm_max_retries, 2);
        assert_eq!(cfg.batch_workers, 8);
    }

    #[test]
    fn toml_partial_fills_with_defaults_and_sanitizes() {
        let cfg: EngineConfig =
            toml::from_str("idle_threshold_secs = 600\nllm_weight = 7.0").unwrap();
        let mut cfg = cfg;
        cfg.sanitize();
        assert_eq!(cfg.idle_threshold_secs, 600);
        assert!((cfg.llm_weight - 1.0).abs() < 1e-6); // clamped
        assert_eq!(cfg.max_text_len, 1000);
    }

    #[test]
    fn model_config_defaults_to_disabled() {
        let cfg = ModelConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.api_key, "ENV");
    }
}
