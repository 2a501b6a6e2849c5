//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::{
    ClearCmd, ConfigCmd, IndexCmd, McpCmd, MkdirCmd, RefreshCmd, RenameCmd, RmCmd, SearchCmd,
    StatsCmd, TreeCmd,
};

#[derive(Parser)]
#[command(name = "tidx")]
#[command(about = "Tree index - browse, search and reorganize indexed directories")]
#[command(version)]
pub struct Cli {
    /// Index directory (default: nearest .treeindex above the working directory)
    #[arg(long, global = true, env = "TIDX_INDEX_DIR")]
    pub index_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Crawl directories and build the tree and content index
    Index(IndexCmd),

    /// Re-crawl indexed roots and update changed files
    Refresh(RefreshCmd),

    /// Print the indexed tree
    Tree(TreeCmd),

    /// Search indexed documents, or images with --image
    Search(SearchCmd),

    /// Create a folder inside the indexed tree
    Mkdir(MkdirCmd),

    /// Rename an indexed file or folder
    Rename(RenameCmd),

    /// Delete an indexed file or folder
    Rm(RmCmd),

    /// Show index statistics
    Stats(StatsCmd),

    /// Drop the content index, snapshot and root list
    Clear(ClearCmd),

    /// Run as MCP server (for AI tools)
    Mcp(McpCmd),

    /// Manage configuration (API keys, models, etc.)
    Config(ConfigCmd),
}

impl Cli {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let index_dir = self.index_dir.as_deref();
        match &self.command {
            Command::Index(cmd) => cmd.run(index_dir).await,
            Command::Refresh(cmd) => cmd.run(index_dir).await,
            Command::Tree(cmd) => cmd.run(index_dir).await,
            Command::Search(cmd) => cmd.run(index_dir).await,
            Command::Mkdir(cmd) => cmd.run(index_dir).await,
            Command::Rename(cmd) => cmd.run(index_dir).await,
            Command::Rm(cmd) => cmd.run(index_dir).await,
            Command::Stats(cmd) => cmd.run(index_dir).await,
            Command::Clear(cmd) => cmd.run(index_dir).await,
            Command::Mcp(cmd) => cmd.run(index_dir).await,
            Command::Config(cmd) => cmd.run().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_index_dir_is_global() {
        let cli = Cli::try_parse_from(["tidx", "search", "notes", "--index-dir", "/tmp/idx"]).unwrap();
        assert_eq!(cli.index_dir, Some(PathBuf::from("/tmp/idx")));
        assert!(matches!(cli.command, Command::Search(_)));
    }
}
