//! Local mode - the indexed tree and its content index on this machine.
//!
//! Stores everything in a `.treeindex/` directory:
//! - `manifest.toml` - indexed roots and storage locations
//! - `vectors/` - LanceDB tables of file embeddings
//! - `tree.json` - the persisted tree snapshot
//! - `trash/` - soft-deleted entries

#![allow(dead_code)]

mod config;
mod content;
mod embed;
mod manifest;
pub mod mcp;
mod models;
mod mutation;
mod search;
mod service;
mod snapshot;
mod store;
mod vector;

pub use config::{DeleteMode, LocalConfig};
pub use content::{IndexProgress, IndexSummary, ProgressSnapshot};
pub use embed::{Embedder, HttpEmbedder};
pub use manifest::IndexManifest;
pub use mutation::{MutationOutcome, MutationStage, RefreshReport};
pub use service::{IndexOptions, IndexReport, TreeService, TreeStats};
pub use store::{Patch, TreeGraph, TreeStore};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The name of the index directory.
pub const INDEX_DIR_NAME: &str = ".treeindex";

/// Find the `.treeindex/` directory by walking up from the given path.
pub fn find_index_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let index_dir = current.join(INDEX_DIR_NAME);
        if index_dir.is_dir() {
            return Some(index_dir);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Pick the index directory: the explicit one, else the nearest existing
/// `.treeindex/` above the working directory. With `create`, fall back to a
/// new `.treeindex/` in the working directory.
pub fn resolve_index_dir(explicit: Option<&Path>, create: bool) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    if let Some(found) = find_index_root(&cwd) {
        return Ok(found);
    }
    if create {
        return Ok(cwd.join(INDEX_DIR_NAME));
    }
    anyhow::bail!("No {INDEX_DIR_NAME} directory found. Run `tidx index <dir>` first.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_find_index_root_walks_up() {
        let dir = tempdir().unwrap();
        let index = dir.path().join(INDEX_DIR_NAME);
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&index).unwrap();
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_index_root(&nested), Some(index));
    }

    #[test]
    fn test_resolve_index_dir_prefers_explicit() {
        let dir = tempdir().unwrap();
        let resolved = resolve_index_dir(Some(dir.path()), false).unwrap();
        assert_eq!(resolved, dir.path());
    }
}
