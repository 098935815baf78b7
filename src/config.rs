// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed configuration.
//!
//! Settings live in `~/.modeldepot/config.json`. A missing file yields
//! the defaults; a malformed file is an error rather than a silent
//! reset, so a typo does not wipe a user's model paths.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default lightweight chat model ensured at startup.
pub const DEFAULT_CHAT_MODEL: &str = "qwen2.5:0.5b";

/// Default embedding model, provisioned only when retrieval is enabled.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Default raw-artifact URL for the heavyweight "pro" model.
const DEFAULT_PRO_MODEL_URL: &str =
    "https://huggingface.co/TheBloke/Mistral-7B-Instruct-v0.2-GGUF/resolve/main/mistral-7b-instruct-v0.2.Q4_K_M.gguf";

/// Filename the pro artifact is stored under in the models directory.
const DEFAULT_PRO_MODEL_FILENAME: &str = "mistral-7b-instruct-v0.2.Q4_K_M.gguf";

/// Identifier the pro model answers to once registered with the runtime.
const DEFAULT_PRO_MODEL_ALIAS: &str = "mistral:7b-quant";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Host the inference runtime listens on.
    pub runtime_host: String,
    /// Port the inference runtime listens on.
    pub runtime_port: u16,
    /// Command used to launch the runtime when it is not already running.
    pub runtime_command: String,
    /// Directory raw model artifacts are downloaded into.
    pub models_dir: PathBuf,
    /// Baseline chat model, always ensured present.
    pub chat_model: String,
    /// Embedding model, ensured present when `retrieval_enabled` is set.
    pub embedding_model: String,
    /// Whether retrieval features (and thus the embedding model) are on.
    pub retrieval_enabled: bool,
    /// Source URL for the pro model artifact.
    pub pro_model_url: String,
    /// Filename for the pro model artifact under `models_dir`.
    pub pro_model_filename: String,
    /// Model identifier used when switching to the pro model.
    pub pro_model_alias: String,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            runtime_host: "127.0.0.1".to_string(),
            runtime_port: 11434,
            runtime_command: "ollama".to_string(),
            models_dir: depot_dir().join("models"),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            retrieval_enabled: true,
            pro_model_url: DEFAULT_PRO_MODEL_URL.to_string(),
            pro_model_filename: DEFAULT_PRO_MODEL_FILENAME.to_string(),
            pro_model_alias: DEFAULT_PRO_MODEL_ALIAS.to_string(),
        }
    }
}

/// Root directory for modeldepot state (`~/.modeldepot`).
pub fn depot_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".modeldepot"))
        .unwrap_or_else(|| PathBuf::from(".modeldepot"))
}

impl DepotConfig {
    /// Path of the config file.
    pub fn config_path() -> PathBuf {
        depot_dir().join("config.json")
    }

    /// Base URL of the runtime HTTP API.
    pub fn runtime_url(&self) -> String {
        format!("http://{}:{}", self.runtime_host, self.runtime_port)
    }

    /// Filesystem path of the pro model artifact.
    pub fn pro_model_path(&self) -> PathBuf {
        self.models_dir.join(&self.pro_model_filename)
    }

    /// The models the supervisor ensures present at startup.
    pub fn baseline_models(&self) -> Vec<String> {
        let mut models = vec![self.chat_model.clone()];
        if self.retrieval_enabled {
            models.push(self.embedding_model.clone());
        }
        models
    }

    /// Load configuration from the default location, falling back to
    /// defaults when no config file exists yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: DepotConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DepotConfig::default();
        assert_eq!(config.runtime_port, 11434);
        assert_eq!(config.chat_model, DEFAULT_CHAT_MODEL);
        assert_eq!(config.runtime_url(), "http://127.0.0.1:11434");
        assert!(config.pro_model_path().ends_with(DEFAULT_PRO_MODEL_FILENAME));
    }

    #[test]
    fn test_baseline_models_respects_retrieval_flag() {
        let mut config = DepotConfig::default();
        assert_eq!(config.baseline_models().len(), 2);

        config.retrieval_enabled = false;
        assert_eq!(config.baseline_models(), vec![DEFAULT_CHAT_MODEL.to_string()]);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = DepotConfig::default();
        config.runtime_port = 12345;
        config.chat_model = "llama3.2:1b".to_string();
        config.save_to(&path).unwrap();

        let loaded = DepotConfig::load_from(&path).unwrap();
        assert_eq!(loaded.runtime_port, 12345);
        assert_eq!(loaded.chat_model, "llama3.2:1b");
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DepotConfig::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.runtime_port, 11434);
    }

    #[test]
    fn test_load_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(DepotConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"runtime_port": 9999}"#).unwrap();

        let loaded = DepotConfig::load_from(&path).unwrap();
        assert_eq!(loaded.runtime_port, 9999);
        assert_eq!(loaded.chat_model, DEFAULT_CHAT_MODEL);
    }
}
