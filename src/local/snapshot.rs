//! Snapshot persistence.
//!
//! The snapshot is written as pretty JSON through a temp file in the same
//! directory followed by a rename, so readers never see a half-written file.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::types::TreeSnapshot;

/// Read a snapshot; `None` when the file does not exist.
pub fn read_snapshot(path: &Path) -> Result<Option<TreeSnapshot>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let snapshot = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
    Ok(Some(snapshot))
}

/// Atomically replace the snapshot file.
pub fn write_snapshot(path: &Path, snapshot: &TreeSnapshot) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temp file")?;
    serde_json::to_writer_pretty(&mut tmp, snapshot).context("Failed to serialize snapshot")?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all().context("Failed to flush snapshot")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    debug!(path = %path.display(), nodes = snapshot.nodes.len(), "snapshot written");
    Ok(())
}

/// Remove the snapshot file if present.
pub fn remove_snapshot(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
