//! Config command - manage local configuration.

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};

use crate::local::{DeleteMode, LocalConfig};

#[derive(Args)]
pub struct ConfigCmd {
    #[command(subcommand)]
    pub command: ConfigSubCmd,
}

#[derive(Subcommand)]
pub enum ConfigSubCmd {
    /// Set the API key for embeddings
    SetKey(SetKeyCmd),

    /// Set the API base URL (default: https://api.openai.com)
    SetUrl(SetUrlCmd),

    /// Set the text embedding model (default: text-embedding-3-small)
    SetModel(SetModelCmd),

    /// Set the image/text embedding model used for images and image search
    SetImageModel(SetModelCmd),

    /// Choose what `rm` does with entries on disk
    SetDeleteMode(SetDeleteModeCmd),

    /// Show current configuration
    Show,
}

#[derive(Args)]
pub struct SetKeyCmd {
    /// API key (OpenAI or any compatible endpoint)
    pub key: String,
}

#[derive(Args)]
pub struct SetUrlCmd {
    /// API base URL (e.g., https://openrouter.ai/api)
    pub url: String,
}

#[derive(Args)]
pub struct SetModelCmd {
    /// Embedding model name (e.g., text-embedding-3-small, clip-vit-base-patch32)
    pub model: String,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DeleteModeArg {
    /// Move into the index's trash directory
    Trash,
    /// Remove from disk
    Hard,
}

#[derive(Args)]
pub struct SetDeleteModeCmd {
    pub mode: DeleteModeArg,
}

impl ConfigCmd {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            ConfigSubCmd::SetKey(cmd) => {
                let mut config = LocalConfig::load()?;
                config.set_openai_key(cmd.key.clone());
                config.save()?;
                println!("API key saved.");
            }
            ConfigSubCmd::SetUrl(cmd) => {
                let mut config = LocalConfig::load()?;
                config.openai_base_url = cmd.url.clone();
                config.save()?;
                println!("Base URL set to: {}", cmd.url);
            }
            ConfigSubCmd::SetModel(cmd) => {
                let mut config = LocalConfig::load()?;
                config.embedding_model = cmd.model.clone();
                config.save()?;
                println!("Text embedding model set to: {}", cmd.model);
                println!("Run `tidx index` again so stored vectors match the new model.");
            }
            ConfigSubCmd::SetImageModel(cmd) => {
                let mut config = LocalConfig::load()?;
                config.image_embedding_model = cmd.model.clone();
                config.save()?;
                println!("Image embedding model set to: {}", cmd.model);
                println!("Run `tidx index` again so stored vectors match the new model.");
            }
            ConfigSubCmd::SetDeleteMode(cmd) => {
                let mut config = LocalConfig::load()?;
                config.delete_mode = match cmd.mode {
                    DeleteModeArg::Trash => DeleteMode::Trash,
                    DeleteModeArg::Hard => DeleteMode::Hard,
                };
                config.save()?;
                println!("Delete mode set to: {:?}", config.delete_mode);
            }
            ConfigSubCmd::Show => {
                let config = LocalConfig::load()?;
                println!("Config: {}", LocalConfig::config_path()?.display());
                println!();
                println!(
                    "api_key:      {}",
                    if config.has_openai_key() {
                        "(set)"
                    } else {
                        "(not set)"
                    }
                );
                println!("base_url:     {}", config.openai_base_url);
                println!("model:        {}", config.embedding_model);
                println!("image_model:  {}", config.image_embedding_model);
                println!("table:        {}", config.table_name);
                println!("search_limit: {}", config.search_limit);
                println!("delete_mode:  {:?}", config.delete_mode);
                println!("exclude:      {}", config.exclude.join(", "));
                println!("hidden:       {}", config.include_hidden);
                println!("max_file:     {} bytes", config.max_file_bytes);
                println!("concurrency:  {}", config.embed_concurrency);
            }
        }
        Ok(())
    }
}
