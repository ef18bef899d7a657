//! Settings for the translation run, loadable from TOML.

use crate::error::TranslateError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default number of cues translated per chunk.
pub const DEFAULT_CHUNK_SIZE: i64 = 50;

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_target_language() -> String {
    "pt-BR".to_string()
}

fn default_chunk_size() -> i64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_rate_limit_cooldown_ms() -> u64 {
    30_000
}

fn default_rate_limit_delay_step_ms() -> u64 {
    5_000
}

fn default_max_chunk_delay_ms() -> u64 {
    60_000
}

fn default_chunk_delay_ms() -> u64 {
    1_000
}

fn default_file_delay_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the OpenAI-compatible chat API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Chat model used for translation
    #[serde(default = "default_model")]
    pub model: String,
    /// Language the subtitles are translated into, also used for the output file name
    #[serde(default = "default_target_language")]
    pub target_language: String,
    /// Cues per chunk; kept signed so that bad values are reported, not wrapped
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    /// Retries after the first attempt of a chunk
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base, doubled on each failed attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Extra wait added when the provider reports a rate limit
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
    /// How much the inter-chunk delay grows on each rate limit
    #[serde(default = "default_rate_limit_delay_step_ms")]
    pub rate_limit_delay_step_ms: u64,
    /// Ceiling for the self-tuned inter-chunk delay
    #[serde(default = "default_max_chunk_delay_ms")]
    pub max_chunk_delay_ms: u64,
    /// Pause between chunks of the same file
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Pause between files
    #[serde(default = "default_file_delay_ms")]
    pub file_delay_ms: u64,
    /// Source term -> required translation
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            target_language: default_target_language(),
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            rate_limit_delay_step_ms: default_rate_limit_delay_step_ms(),
            max_chunk_delay_ms: default_max_chunk_delay_ms(),
            chunk_delay_ms: default_chunk_delay_ms(),
            file_delay_ms: default_file_delay_ms(),
            glossary: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    /// Validated chunk size.
    pub fn chunk_size(&self) -> std::result::Result<usize, TranslateError> {
        if self.chunk_size <= 0 {
            return Err(TranslateError::InvalidArgument(format!(
                "chunk size must be positive, got {}",
                self.chunk_size
            )));
        }
        Ok(self.chunk_size as usize)
    }

    pub fn file_delay(&self) -> Duration {
        Duration::from_millis(self.file_delay_ms)
    }
}
