//! Application configuration for Examflow.
//!
//! User config lives at `~/.examflow/examflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ExamflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "examflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".examflow";

// ---------------------------------------------------------------------------
// Config structs (matching examflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OCR provider settings.
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Classifier provider settings.
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the local database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// HTTP timeout for provider calls, in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_database_path() -> String {
    "~/.examflow/examflow.db".into()
}
fn default_http_timeout_secs() -> u64 {
    30
}

/// `[ocr]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// OCR provider endpoint URL.
    #[serde(default = "default_ocr_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the app key (never store the key itself).
    #[serde(default = "default_ocr_key_env")]
    pub app_key_env: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ocr_endpoint(),
            app_key_env: default_ocr_key_env(),
        }
    }
}

fn default_ocr_endpoint() -> String {
    "https://api.mathpix.com/v3/text".into()
}
fn default_ocr_key_env() -> String {
    "EXAMFLOW_OCR_APP_KEY".into()
}

/// `[classifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Classifier endpoint URL.
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the access key.
    #[serde(default = "default_classifier_key_env")]
    pub access_key_env: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            access_key_env: default_classifier_key_env(),
        }
    }
}

fn default_classifier_endpoint() -> String {
    "https://classifier.examflow.internal/v1/classify".into()
}
fn default_classifier_key_env() -> String {
    "EXAMFLOW_CLASSIFIER_KEY".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.examflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ExamflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.examflow/examflow.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ExamflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ExamflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ExamflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ExamflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ExamflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` in a configured path against the user's home.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Read a provider key from the named env var; error if unset or empty.
pub fn require_access_key(env_name: &str) -> Result<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ExamflowError::config(format!(
            "provider key not found. Set the {env_name} environment variable."
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
        assert!(toml_str.contains("database_path"));
        assert!(toml_str.contains("EXAMFLOW_CLASSIFIER_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.http_timeout_secs, 30);
        assert_eq!(parsed.ocr.app_key_env, "EXAMFLOW_OCR_APP_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[classifier]
endpoint = "https://ml.example.com/classify"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.classifier.endpoint, "https://ml.example.com/classify");
        assert_eq!(config.classifier.access_key_env, "EXAMFLOW_CLASSIFIER_KEY");
        assert_eq!(config.defaults.database_path, "~/.examflow/examflow.db");
    }

    #[test]
    fn expand_home_passthrough() {
        assert_eq!(expand_home("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn missing_access_key_is_an_error() {
        // Use a unique env var name to avoid interfering with other tests
        let result = require_access_key("EF_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("key not found"));
    }
}
