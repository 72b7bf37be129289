//! Application configuration for ConceptForge.
//!
//! User config lives at `~/.conceptforge/conceptforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConceptForgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "conceptforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".conceptforge";

// ---------------------------------------------------------------------------
// Config structs (matching conceptforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Extraction pipeline tuning.
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the local database.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.conceptforge/data".into()
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Chat-completions endpoint base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model to use for extraction and similarity scoring.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total attempts per call (1 initial + retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in ms; the nth retry waits `n * base`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_api_key_env() -> String {
    "CONCEPTFORGE_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Delay between chunk extractions, bounding request rate.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,

    /// Similarity-check batch size. Comparisons within a batch run
    /// concurrently; batches are sequential.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cooldown between similarity batches.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Concept index cache time-to-live.
    #[serde(default = "default_index_ttl_secs")]
    pub index_ttl_secs: u64,

    /// Confidence at or above which a concept counts as high-confidence.
    #[serde(default = "default_high_confidence")]
    pub high_confidence_threshold: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            chunk_delay_ms: default_chunk_delay_ms(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            index_ttl_secs: default_index_ttl_secs(),
            high_confidence_threshold: default_high_confidence(),
        }
    }
}

fn default_chunk_delay_ms() -> u64 {
    1500
}
fn default_batch_size() -> usize {
    3
}
fn default_batch_delay_ms() -> u64 {
    1000
}
fn default_index_ttl_secs() -> u64 {
    300
}
fn default_high_confidence() -> f64 {
    0.8
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.conceptforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ConceptForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.conceptforge/conceptforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ConceptForgeError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ConceptForgeError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ConceptForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ConceptForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ConceptForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand the configured data directory, resolving a leading `~`.
pub fn resolve_data_dir(config: &AppConfig) -> Result<PathBuf> {
    let raw = &config.defaults.data_dir;
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| ConceptForgeError::config("could not determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(raw))
}

/// Check that the LLM API key env var is set and non-empty, and return it.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ConceptForgeError::config(format!(
            "LLM API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("CONCEPTFORGE_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.llm.timeout_secs, 30);
        assert_eq!(parsed.llm.max_attempts, 3);
        assert_eq!(parsed.extraction.batch_size, 3);
        assert_eq!(parsed.extraction.chunk_delay_ms, 1500);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[llm]
model = "local-test-model"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.llm.model, "local-test-model");
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
        assert_eq!(config.extraction.index_ttl_secs, 300);
        assert!((config.extraction.high_confidence_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.llm.api_key_env = "CF_TEST_NONEXISTENT_KEY_12345".into();
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
