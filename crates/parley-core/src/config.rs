use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ParleyError, Result};
use crate::types::BASELINE_MODEL_ID;

/// Top-level configuration for Parley.
///
/// Loaded from `~/.parley/config.toml` by default. Each section corresponds
/// to one collaborator of the response orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

impl ParleyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ParleyConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ParleyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the conversation database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.parley/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Remote language-model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub generation_path: String,
    pub retrieval_path: String,
    pub request_timeout_secs: u64,
    /// Bearer token sent with every request, if set.
    pub api_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            generation_path: "/api/chat".to_string(),
            retrieval_path: "/api/retrieve".to_string(),
            request_timeout_secs: 120,
            api_token: None,
        }
    }
}

/// Stream assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Minimum milliseconds between partial republishes.
    pub update_interval_ms: u64,
    /// Appended to the partial reply when the stream breaks mid-flight.
    pub error_suffix: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 50,
            error_suffix: "\n\n[Error: the response was interrupted.]".to_string(),
        }
    }
}

/// Retrieval augmentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Model ids that always need retrieval, on top of catalog flags.
    pub dependent_models: Vec<String>,
    /// How long to wait for parallel citations before persisting.
    pub citation_wait_ms: u64,
    /// Citations enabled when no explicit setting has been received.
    pub citations_by_default: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dependent_models: Vec::new(),
            citation_wait_ms: 2000,
            citations_by_default: false,
        }
    }
}

/// Heuristic token estimation constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub chars_per_token: f64,
    /// Added to every message estimate.
    pub per_message_overhead: u64,
    /// Added once per request.
    pub base_overhead: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 3.5,
            per_message_overhead: 3,
            base_overhead: 3,
        }
    }
}

/// Model selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Model used when the user has not picked one.
    pub default_model: String,
    /// Workflow model hint -> catalog model id.
    pub workflow_models: HashMap<String, String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let workflow_models = [
            ("gpt-4o", "gpt-4o"),
            ("gpt-4o-mini", "gpt-4o-mini"),
            ("o3-mini", "o3-mini"),
            ("reasoning", "o3-mini"),
            ("grounded", "gpt-4o-grounded"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            default_model: BASELINE_MODEL_ID.to_string(),
            workflow_models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = ParleyConfig::default();
        assert_eq!(config.general.data_dir, "~/.parley/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.stream.update_interval_ms, 50);
        assert!((config.tokens.chars_per_token - 3.5).abs() < f64::EPSILON);
        assert_eq!(config.tokens.per_message_overhead, 3);
        assert_eq!(config.retrieval.citation_wait_ms, 2000);
        assert!(!config.retrieval.citations_by_default);
        assert_eq!(config.models.default_model, BASELINE_MODEL_ID);
        assert_eq!(
            config.models.workflow_models.get("reasoning").map(String::as_str),
            Some("o3-mini")
        );
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/custom/data"
log_level = "debug"

[backend]
base_url = "https://llm.example.com"
request_timeout_secs = 30
api_token = "secret"

[stream]
update_interval_ms = 100

[retrieval]
dependent_models = ["gpt-4o"]
citation_wait_ms = 500

[models]
default_model = "gpt-4o"

[models.workflow_models]
tax = "gpt-4o"
"#;
        let file = create_temp_config(content);
        let config = ParleyConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/custom/data");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.backend.base_url, "https://llm.example.com");
        assert_eq!(config.backend.request_timeout_secs, 30);
        assert_eq!(config.backend.api_token.as_deref(), Some("secret"));
        // Unset fields in a present section keep their defaults.
        assert_eq!(config.backend.generation_path, "/api/chat");
        assert_eq!(config.stream.update_interval_ms, 100);
        assert_eq!(config.retrieval.dependent_models, vec!["gpt-4o"]);
        assert_eq!(config.retrieval.citation_wait_ms, 500);
        assert_eq!(config.models.default_model, "gpt-4o");
        assert_eq!(config.models.workflow_models.len(), 1);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "warn"
"#;
        let file = create_temp_config(content);
        let config = ParleyConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.stream.update_interval_ms, 50);
        assert_eq!(config.tokens.base_overhead, 3);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(ParleyConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = ParleyConfig::default();
        config.stream.update_interval_ms = 75;
        config.save(&path).unwrap();

        assert!(path.exists());
        let reloaded = ParleyConfig::load(&path).unwrap();
        assert_eq!(reloaded.stream.update_interval_ms, 75);
        assert_eq!(reloaded.stream.error_suffix, config.stream.error_suffix);
        assert_eq!(
            reloaded.models.workflow_models,
            config.models.workflow_models
        );
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = ParleyConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.backend.retrieval_path, "/api/retrieve");
    }
}
