//! CLI command implementations.

mod clear;
mod config;
mod index;
mod mcp;
mod mkdir;
mod refresh;
mod rename;
mod rm;
mod search;
mod stats;
mod tree;

pub use clear::ClearCmd;
pub use config::ConfigCmd;
pub use index::IndexCmd;
pub use mcp::McpCmd;
pub use mkdir::MkdirCmd;
pub use refresh::RefreshCmd;
pub use rename::RenameCmd;
pub use rm::RmCmd;
pub use search::SearchCmd;
pub use stats::StatsCmd;
pub use tree::TreeCmd;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::local::{self, HttpEmbedder, LocalConfig, MutationOutcome, TreeService};
use crate::types::FlatKey;

/// Open the tree service for the CLI, resolving the index directory.
async fn open_service(index_dir: Option<&Path>, create: bool) -> Result<TreeService<HttpEmbedder>> {
    let index_dir = local::resolve_index_dir(index_dir, create)?;
    let config = LocalConfig::load()?;
    let embedder = Arc::new(HttpEmbedder::from_config(&config));
    TreeService::open(&index_dir, config, embedder).await
}

/// Turn a user-supplied path into the flat key the tree uses. The parent
/// directory is canonicalized and the final component kept as written, so a
/// symlink names itself rather than its target.
fn to_key(path: &Path) -> Result<FlatKey> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Cannot resolve {}", path.display()))?;
    let resolved = match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match std::fs::canonicalize(parent) {
            Ok(parent) => parent.join(name),
            Err(_) => absolute,
        },
        _ => std::fs::canonicalize(&absolute).unwrap_or(absolute),
    };
    FlatKey::from_fs_path(&resolved).with_context(|| format!("Invalid path: {}", path.display()))
}

fn print_warnings(outcome: &MutationOutcome) {
    for warning in &outcome.index_warnings {
        println!("  warning: {}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_to_key_canonicalizes_existing_paths() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let dotted = dir.path().join("sub").join("..").join("sub");

        let key = to_key(&dotted).unwrap();
        let expected = FlatKey::from_fs_path(&std::fs::canonicalize(dir.path().join("sub")).unwrap()).unwrap();
        assert_eq!(key, expected);
    }

    #[test]
    fn test_to_key_accepts_missing_paths() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone.txt");
        let key = to_key(&missing).unwrap();
        assert_eq!(key.file_name(), "gone.txt");
    }

    #[cfg(unix)]
    #[test]
    fn test_to_key_keeps_symlink_name() {
        let dir = tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::write(root.join("real.txt"), "contents").unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();

        let key = to_key(&root.join("link.txt")).unwrap();
        assert_eq!(key, FlatKey::from_fs_path(&root.join("link.txt")).unwrap());
    }
}
