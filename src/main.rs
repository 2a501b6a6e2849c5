//! Tree index CLI - an indexed file tree with semantic text and image search.

mod cli;
mod commands;
mod crawler;
mod extract;
mod local;
mod types;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // MCP mode inits its own subscriber (writes to stderr), so skip here
    if !matches!(cli.command, Command::Mcp(_)) {
        // Initialize tracing for non-MCP commands (controlled by RUST_LOG env var)
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .init();
    }

    cli.execute().await
}
