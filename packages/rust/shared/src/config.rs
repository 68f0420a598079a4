//! Application configuration for imgdesc.
//!
//! User config lives at `~/.imgdesc/imgdesc.toml`.
//! CLI flags override config file values, which override defaults.
//! Pipeline components never read this file themselves: they receive the
//! runtime structs ([`WorklistConfig`], [`FetchConfig`], [`InferenceConfig`],
//! [`StorageConfig`]) built from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ImgDescError, Result};
use crate::retry::RetryPolicy;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "imgdesc.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".imgdesc";

// ---------------------------------------------------------------------------
// Config structs (matching imgdesc.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub worklist: WorklistSection,

    #[serde(default)]
    pub fetch: FetchSection,

    #[serde(default)]
    pub inference: InferenceSection,

    #[serde(default)]
    pub storage: StorageSection,
}

/// `[worklist]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorklistSection {
    /// First id (inclusive).
    #[serde(default = "default_start")]
    pub start: i64,

    /// Last id (inclusive).
    #[serde(default = "default_end")]
    pub end: i64,

    /// URL template with a single `{id}` placeholder.
    #[serde(default = "default_url_template")]
    pub url_template: String,
}

impl Default for WorklistSection {
    fn default() -> Self {
        Self {
            start: default_start(),
            end: default_end(),
            url_template: default_url_template(),
        }
    }
}

fn default_start() -> i64 {
    1
}
fn default_end() -> i64 {
    100
}
fn default_url_template() -> String {
    "https://picsum.photos/id/{id}/512/512".into()
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSection {
    /// Per-request timeout.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Attempts per item, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum concurrent downloads.
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_fetch_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_fetch_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_attempts: default_max_attempts(),
            concurrency: default_fetch_concurrency(),
            base_delay_ms: default_fetch_base_delay(),
            max_delay_ms: default_fetch_max_delay(),
        }
    }
}

fn default_fetch_timeout() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_fetch_concurrency() -> usize {
    // Downloads are I/O bound; a few in flight per core keeps the pipe full.
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(16)
}
fn default_fetch_base_delay() -> u64 {
    200
}
fn default_fetch_max_delay() -> u64 {
    5_000
}

/// `[inference]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSection {
    /// Model identifier passed to the backend.
    #[serde(default = "default_model")]
    pub model: String,

    /// Prompt sent alongside every image.
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// OpenAI-compatible API root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Maximum concurrent inference calls.
    #[serde(default = "default_inference_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Rate limits clear in seconds, so this starts much higher than fetch.
    #[serde(default = "default_inference_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_inference_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,

    /// Reuse descriptions of identical images across runs.
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            prompt: default_prompt(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            concurrency: default_inference_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_inference_base_delay(),
            max_delay_ms: default_inference_max_delay(),
            timeout_secs: default_inference_timeout(),
            cache: default_true(),
        }
    }
}

fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_prompt() -> String {
    "Describe this image in one or two sentences.".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_inference_concurrency() -> usize {
    4
}
fn default_inference_base_delay() -> u64 {
    2_000
}
fn default_inference_max_delay() -> u64 {
    30_000
}
fn default_inference_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// libSQL database file. A leading `~/` is expanded.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_urls_table")]
    pub urls_table: String,

    #[serde(default = "default_codes_table")]
    pub codes_table: String,

    #[serde(default = "default_descriptions_table")]
    pub descriptions_table: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            urls_table: default_urls_table(),
            codes_table: default_codes_table(),
            descriptions_table: default_descriptions_table(),
        }
    }
}

fn default_db_path() -> String {
    "~/.imgdesc/imgdesc.db".into()
}
fn default_urls_table() -> String {
    "image_urls".into()
}
fn default_codes_table() -> String {
    "image_codes".into()
}
fn default_descriptions_table() -> String {
    "image_desc".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Worklist range and template, validated by the generator.
#[derive(Debug, Clone)]
pub struct WorklistConfig {
    pub start: i64,
    pub end: i64,
    pub url_template: String,
}

impl From<&AppConfig> for WorklistConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            start: config.worklist.start,
            end: config.worklist.end,
            url_template: config.worklist.url_template.clone(),
        }
    }
}

/// Runtime fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        let fetch = &config.fetch;
        Self {
            timeout: Duration::from_secs(fetch.timeout_secs),
            concurrency: fetch.concurrency.max(1),
            retry: RetryPolicy::new(
                fetch.max_attempts,
                Duration::from_millis(fetch.base_delay_ms),
                Duration::from_millis(fetch.max_delay_ms),
            ),
        }
    }
}

/// Runtime inference configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model: String,
    pub prompt: String,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub cache: bool,
}

impl From<&AppConfig> for InferenceConfig {
    fn from(config: &AppConfig) -> Self {
        let inference = &config.inference;
        Self {
            model: inference.model.clone(),
            prompt: inference.prompt.clone(),
            concurrency: inference.concurrency.max(1),
            retry: RetryPolicy::new(
                inference.max_attempts,
                Duration::from_millis(inference.base_delay_ms),
                Duration::from_millis(inference.max_delay_ms),
            ),
            timeout: Duration::from_secs(inference.timeout_secs),
            cache: inference.cache,
        }
    }
}

/// Target table names for each stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub urls: String,
    pub codes: String,
    pub descriptions: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            urls: default_urls_table(),
            codes: default_codes_table(),
            descriptions: default_descriptions_table(),
        }
    }
}

/// Runtime storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub tables: TableNames,
}

impl StorageConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            db_path: expand_home(&config.storage.db_path)?,
            tables: TableNames {
                urls: config.storage.urls_table.clone(),
                codes: config.storage.codes_table.clone(),
                descriptions: config.storage.descriptions_table.clone(),
            },
        })
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ImgDescError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.imgdesc/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ImgDescError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.imgdesc/imgdesc.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ImgDescError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ImgDescError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ImgDescError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ImgDescError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ImgDescError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the inference API key from the env var named in the config.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.inference.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ImgDescError::config(format!(
            "inference API key not found. Set the {var_name} environment variable."
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
        assert!(toml_str.contains("url_template"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("image_desc"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.fetch.max_attempts, 3);
        assert_eq!(parsed.fetch.timeout_secs, 10);
        assert_eq!(parsed.inference.api_key_env, "OPENROUTER_API_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[worklist]
start = 1
end = 3
url_template = "https://x/{id}"

[inference]
model = "test/model"
concurrency = 2
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.worklist.end, 3);
        assert_eq!(config.inference.model, "test/model");
        assert_eq!(config.inference.prompt, default_prompt());
        assert_eq!(config.storage.codes_table, "image_codes");
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();

        let fetch = FetchConfig::from(&app);
        assert_eq!(fetch.timeout, Duration::from_secs(10));
        assert_eq!(fetch.retry.max_attempts, 3);
        assert_eq!(fetch.retry.base_delay, Duration::from_millis(200));
        assert!(fetch.concurrency >= 1);

        let inference = InferenceConfig::from(&app);
        assert_eq!(inference.concurrency, 4);
        assert!(inference.retry.base_delay > fetch.retry.base_delay);

        let worklist = WorklistConfig::from(&app);
        assert_eq!((worklist.start, worklist.end), (1, 100));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let mut app = AppConfig::default();
        app.fetch.concurrency = 0;
        app.inference.concurrency = 0;
        assert_eq!(FetchConfig::from(&app).concurrency, 1);
        assert_eq!(InferenceConfig::from(&app).concurrency, 1);
    }

    #[test]
    fn storage_config_keeps_relative_paths() {
        let mut app = AppConfig::default();
        app.storage.db_path = "var/run.db".into();
        let storage = StorageConfig::from_app(&app).unwrap();
        assert_eq!(storage.db_path, PathBuf::from("var/run.db"));
        assert_eq!(storage.tables, TableNames::default());
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.inference.api_key_env = "IMGDESC_TEST_NONEXISTENT_KEY_12345".into();
        let err = resolve_api_key(&config).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("API key not found"));
    }
}
