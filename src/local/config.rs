//! Local configuration management.
//!
//! Config is stored at `~/.config/treeindex/config.toml` and contains:
//! - OpenAI-compatible endpoint, key and models for embeddings
//! - crawl and delete behaviour shared by the CLI and the MCP server

use std::path::PathBuf;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

const CONFIG_DIR: &str = "treeindex";
const CONFIG_FILE: &str = "config.toml";

/// What `delete` does with the entry on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Move into the index directory's `trash/`.
    #[default]
    Trash,
    Hard,
}

/// Local configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// OpenAI API key for embeddings.
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Base URL for OpenAI-compatible API (default: https://api.openai.com).
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    /// Model to use for text embeddings (default: text-embedding-3-small).
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Model serving the shared image/text space used by image search.
    #[serde(default = "default_image_embedding_model")]
    pub image_embedding_model: String,

    /// Base name of the vector tables; `-text` and `-image` are appended.
    #[serde(default = "default_table_name")]
    pub table_name: String,

    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    #[serde(default)]
    pub delete_mode: DeleteMode,

    /// Glob patterns matched against entry names; matches are not crawled.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    #[serde(default = "default_include_hidden")]
    pub include_hidden: bool,

    /// Files above this size are left out of the content index.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Embedding requests in flight at once.
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_image_embedding_model() -> String {
    "clip-vit-base-patch32".to_string()
}

fn default_table_name() -> String {
    "files".to_string()
}

fn default_search_limit() -> usize {
    10
}

fn default_exclude() -> Vec<String> {
    vec![
        ".git".to_string(),
        "node_modules".to_string(),
        super::INDEX_DIR_NAME.to_string(),
    ]
}

fn default_include_hidden() -> bool {
    true
}

fn default_max_file_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_embed_concurrency() -> usize {
    4
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            embedding_model: default_embedding_model(),
            image_embedding_model: default_image_embedding_model(),
            table_name: default_table_name(),
            search_limit: default_search_limit(),
            delete_mode: DeleteMode::default(),
            exclude: default_exclude(),
            include_hidden: default_include_hidden(),
            max_file_bytes: default_max_file_bytes(),
            embed_concurrency: default_embed_concurrency(),
        }
    }
}

impl LocalConfig {
    /// Load config from the default location.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&path, content).context("Failed to write config file")
    }

    /// Get the OpenAI API key as a SecretString.
    pub fn openai_api_key_secret(&self) -> Option<SecretString> {
        self.openai_api_key
            .clone()
            .filter(|k| !k.is_empty())
            .map(SecretString::from)
    }

    /// Check if the config has a valid OpenAI API key.
    pub fn has_openai_key(&self) -> bool {
        self.openai_api_key
            .as_ref()
            .map(|k| !k.is_empty())
            .unwrap_or(false)
    }

    /// Set the OpenAI API key.
    pub fn set_openai_key(&mut self, key: String) {
        self.openai_api_key = Some(key);
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }
}
