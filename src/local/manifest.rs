//! Index manifest: which roots are indexed and where their data lives.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const MANIFEST_FILE: &str = "manifest.toml";
const VECTORS_DIR: &str = "vectors";
const SNAPSHOT_FILE: &str = "tree.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Canonical root directories, in index order.
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    pub table_name: String,

    pub db_path: PathBuf,

    pub snapshot_path: PathBuf,

    #[serde(default)]
    pub synthesize_ancestors: bool,
}

impl IndexManifest {
    /// Default layout under `index_dir`.
    pub fn new(index_dir: &Path, table_name: &str) -> Self {
        Self {
            roots: Vec::new(),
            table_name: table_name.to_string(),
            db_path: index_dir.join(VECTORS_DIR),
            snapshot_path: index_dir.join(SNAPSHOT_FILE),
            synthesize_ancestors: false,
        }
    }

    pub fn path(index_dir: &Path) -> PathBuf {
        index_dir.join(MANIFEST_FILE)
    }

    /// Load the manifest, or the default layout if none was saved yet.
    pub fn load_or_default(index_dir: &Path, table_name: &str) -> Result<Self> {
        let path = Self::path(index_dir);
        if !path.exists() {
            return Ok(Self::new(index_dir, table_name));
        }

        let content = std::fs::read_to_string(&path).context("Failed to read manifest")?;
        toml::from_str(&content).context("Failed to parse manifest")
    }

    pub fn save(&self, index_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(index_dir).context("Failed to create index directory")?;
        let content = toml::to_string_pretty(self).context("Failed to serialize manifest")?;
        std::fs::write(Self::path(index_dir), content).context("Failed to write manifest")
    }

    pub fn remove(index_dir: &Path) -> Result<()> {
        match std::fs::remove_file(Self::path(index_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove manifest"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_layout() {
        let dir = tempdir().unwrap();
        let manifest = IndexManifest::load_or_default(dir.path(), "files").unwrap();
        assert!(manifest.roots.is_empty());
        assert_eq!(manifest.db_path, dir.path().join("vectors"));
        assert_eq!(manifest.snapshot_path, dir.path().join("tree.json"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut manifest = IndexManifest::new(dir.path(), "docs");
        manifest.roots.push(PathBuf::from("/srv/data"));
        manifest.synthesize_ancestors = true;
        manifest.save(dir.path()).unwrap();

        let loaded = IndexManifest::load_or_default(dir.path(), "ignored").unwrap();
        assert_eq!(loaded, manifest);

        IndexManifest::remove(dir.path()).unwrap();
        assert!(!IndexManifest::path(dir.path()).exists());
    }
}
