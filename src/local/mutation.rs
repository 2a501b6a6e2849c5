//! Structural mutations.
//!
//! Each mutation walks `Requested -> Validated -> AppliedOnDisk -> Reindexed
//! -> Snapshotted -> Completed`, or stops at `Rejected` if a precondition
//! fails. Preconditions are all checked before the disk is touched. Once the
//! disk has changed, content-index failures become warnings on the outcome and
//! the tree is still patched to mirror the disk.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::DeleteMode;
use super::content::{ContentIndexer, IndexProgress, IndexSummary};
use super::embed::Embedder;
use super::store::{Patch, TreeGraph, TreeStore};
use super::vector::VectorStore;
use crate::crawler::{CrawlIssue, CrawlOptions, crawl_roots, crawl_subtree};
use crate::extract::ContentKind;
use crate::types::{
    FlatKey, PathError, TreeError, TreeNode, TreeResult, TreeSnapshot, extension_of,
    timestamp_key, validate_name,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStage {
    Requested,
    Validated,
    AppliedOnDisk,
    Reindexed,
    Snapshotted,
    Completed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateFolder,
    Rename,
    Delete,
}

impl MutationKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::CreateFolder => "create_folder",
            Self::Rename => "rename",
            Self::Delete => "delete",
        }
    }
}

/// A change to the list of indexed roots caused by a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootChange {
    Renamed { from: PathBuf, to: PathBuf },
    Removed(PathBuf),
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub operation: MutationKind,
    pub stage: MutationStage,
    /// Resulting path: the created folder, the renamed entry, the deleted entry.
    pub path: FlatKey,
    /// CreateFolder found the folder already indexed and did nothing.
    pub existed: bool,
    pub index_warnings: Vec<String>,
    pub snapshot: TreeSnapshot,
    #[serde(skip)]
    pub root_change: Option<RootChange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub purged: usize,
    pub summary: IndexSummary,
    pub crawl_errors: Vec<CrawlIssue>,
    /// Roots no longer on disk; they are dropped from the root list.
    pub removed_roots: Vec<PathBuf>,
    pub snapshot: TreeSnapshot,
}

/// Stage tracker; every transition is traced.
struct Tracker {
    kind: MutationKind,
    target: String,
    stage: MutationStage,
}

impl Tracker {
    fn start(kind: MutationKind, target: &impl fmt::Display) -> Self {
        let target = target.to_string();
        debug!(op = kind.as_str(), target = %target, "mutation requested");
        Self {
            kind,
            target,
            stage: MutationStage::Requested,
        }
    }

    fn advance(&mut self, stage: MutationStage) {
        debug!(
            op = self.kind.as_str(),
            target = %self.target,
            from = ?self.stage,
            to = ?stage,
            "mutation stage"
        );
        self.stage = stage;
    }

    fn reject(&mut self, err: TreeError) -> TreeError {
        self.advance(MutationStage::Rejected);
        warn!(op = self.kind.as_str(), target = %self.target, error = %err, "mutation rejected");
        err
    }

    fn complete(
        mut self,
        path: FlatKey,
        existed: bool,
        index_warnings: Vec<String>,
        snapshot: TreeSnapshot,
        root_change: Option<RootChange>,
    ) -> MutationOutcome {
        self.advance(MutationStage::Completed);
        info!(op = self.kind.as_str(), path = %path, warnings = index_warnings.len(), "mutation completed");
        MutationOutcome {
            operation: self.kind,
            stage: self.stage,
            path,
            existed,
            index_warnings,
            snapshot,
            root_change,
        }
    }
}

/// Executes mutations against disk, vector store and tree.
///
/// Callers hold the writer lane for the lifetime of the handler.
pub struct MutationHandler<'a, E> {
    pub store: &'a TreeStore,
    pub vectors: &'a VectorStore,
    pub content: &'a ContentIndexer<E>,
    pub crawl: &'a CrawlOptions,
    pub roots: &'a [PathBuf],
    pub delete_mode: DeleteMode,
    pub trash_dir: &'a Path,
}

impl<E: Embedder> MutationHandler<'_, E> {
    pub async fn create_folder(&self, parent: &FlatKey, name: &str) -> TreeResult<MutationOutcome> {
        let mut t = Tracker::start(MutationKind::CreateFolder, parent);
        let graph = self.store.current();

        let parent_node = match graph.resolve(parent) {
            None => return Err(t.reject(TreeError::NotIndexed(parent.to_string()))),
            Some(n) if n.is_synthetic => return Err(t.reject(placeholder(parent))),
            Some(n) if !n.is_directory => {
                return Err(t.reject(PathError::NotADirectory(parent.to_string()).into()));
            }
            Some(n) => n.clone(),
        };
        validate_name(name).map_err(|e| t.reject(e.into()))?;
        let target = parent.join(name).map_err(|e| t.reject(e.into()))?;

        if let Some(existing) = graph.resolve(&target) {
            if existing.is_directory {
                return Ok(t.complete(target, true, vec![], graph.to_snapshot(), None));
            }
            return Err(t.reject(TreeError::AlreadyExists(target.to_string())));
        }
        t.advance(MutationStage::Validated);

        let fs_path = target.to_fs_path();
        let mut warnings = Vec::new();
        let patch = match tokio::fs::create_dir(&fs_path).await {
            Ok(()) => {
                let metadata = match tokio::fs::metadata(&fs_path).await {
                    Ok(metadata) => metadata,
                    Err(e) => return Err(t.reject(undo_create(&fs_path, e).await)),
                };
                Patch::Added(vec![TreeNode::from_metadata(
                    target.clone(),
                    Some(parent_node.id),
                    &metadata,
                )])
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && fs_path.is_dir() => {
                info!(path = %fs_path.display(), "folder already on disk, re-crawling parent");
                let nodes = self.rescan(&parent_node).await?;
                let known: HashSet<&FlatKey> = graph
                    .descendants(parent_node.id)
                    .into_iter()
                    .map(|n| &n.absolute_path)
                    .collect();
                let fresh: Vec<TreeNode> = nodes
                    .iter()
                    .filter(|n| n.is_content_file() && !known.contains(&n.absolute_path))
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    let summary = self.content.index_many(fresh, &IndexProgress::default()).await;
                    warnings.extend(summary.failures.iter().map(|f| format!("{}: {}", f.path, f.error)));
                }
                Patch::Replaced(nodes)
            }
            Err(e) => return Err(t.reject(TreeError::fs("create_dir", &fs_path, e))),
        };
        t.advance(MutationStage::AppliedOnDisk);
        t.advance(MutationStage::Reindexed);

        let snapshot = self.publish(vec![patch]).await?;
        t.advance(MutationStage::Snapshotted);
        Ok(t.complete(target, false, warnings, snapshot, None))
    }

    pub async fn rename(&self, old: &FlatKey, new_name: &str) -> TreeResult<MutationOutcome> {
        let mut t = Tracker::start(MutationKind::Rename, old);
        let graph = self.store.current();

        let node = match graph.resolve(old) {
            None => return Err(t.reject(TreeError::NotIndexed(old.to_string()))),
            Some(n) if n.is_synthetic => return Err(t.reject(placeholder(old))),
            Some(n) => n.clone(),
        };
        validate_name(new_name).map_err(|e| t.reject(e.into()))?;
        let name = effective_name(&node, new_name);
        let new_key = old.with_file_name(&name).map_err(|e| t.reject(e.into()))?;

        if new_key == *old {
            return Ok(t.complete(new_key, false, vec![], graph.to_snapshot(), None));
        }
        let old_fs = old.to_fs_path();
        let new_fs = new_key.to_fs_path();
        if graph.resolve(&new_key).is_some() || tokio::fs::symlink_metadata(&new_fs).await.is_ok() {
            return Err(t.reject(TreeError::AlreadyExists(new_key.to_string())));
        }
        t.advance(MutationStage::Validated);

        tokio::fs::rename(&old_fs, &new_fs)
            .await
            .map_err(|e| t.reject(TreeError::fs("rename", &old_fs, e)))?;
        t.advance(MutationStage::AppliedOnDisk);

        let mut warnings = Vec::new();
        if node.is_directory {
            let moves: Vec<(FlatKey, FlatKey)> = graph
                .descendants(node.id)
                .into_iter()
                .filter(|n| n.is_content_file())
                .filter_map(|n| {
                    let to = n.absolute_path.rebase(old, &new_key)?;
                    Some((n.absolute_path.clone(), to))
                })
                .collect();
            match self.vectors.move_paths(&moves).await {
                Ok(moved) => debug!(moved, "rewrote record paths"),
                Err(e) => warnings.push(format!("{e:#}")),
            }
        } else {
            if let Err(e) = self.vectors.delete_paths(std::slice::from_ref(old)).await {
                warnings.push(format!("{e:#}"));
            }
            let renamed = node.moved_to(new_key.clone(), node.parent_id);
            if let Err(e) = self.content.index_content(&renamed).await {
                warnings.push(format!("{new_key}: {e}"));
            }
        }
        for warning in &warnings {
            warn!(path = %new_key, warning = %warning, "index update after rename failed");
        }
        t.advance(MutationStage::Reindexed);

        let snapshot = self
            .publish(vec![Patch::Renamed {
                id: node.id,
                new_name: name,
            }])
            .await?;
        t.advance(MutationStage::Snapshotted);

        let root_change = self
            .roots
            .contains(&old_fs)
            .then(|| RootChange::Renamed {
                from: old_fs,
                to: new_fs,
            });
        Ok(t.complete(new_key, false, warnings, snapshot, root_change))
    }

    pub async fn delete(&self, path: &FlatKey) -> TreeResult<MutationOutcome> {
        let mut t = Tracker::start(MutationKind::Delete, path);
        let graph = self.store.current();

        let node = match graph.resolve(path) {
            None => return Err(t.reject(TreeError::NotIndexed(path.to_string()))),
            Some(n) if n.is_synthetic => return Err(t.reject(placeholder(path))),
            Some(n) => n.clone(),
        };
        t.advance(MutationStage::Validated);

        let fs_path = path.to_fs_path();
        self.remove_from_disk(&node, &fs_path)
            .await
            .map_err(|e| t.reject(e))?;
        t.advance(MutationStage::AppliedOnDisk);

        let files: Vec<FlatKey> = std::iter::once(&node)
            .chain(graph.descendants(node.id))
            .filter(|n| n.is_content_file())
            .map(|n| n.absolute_path.clone())
            .collect();
        let mut warnings = Vec::new();
        if let Err(e) = self.vectors.delete_paths(&files).await {
            warn!(path = %path, error = %e, "failed to purge records");
            warnings.push(format!("{e:#}"));
        }
        t.advance(MutationStage::Reindexed);

        let snapshot = self.publish(vec![Patch::Removed(node.id)]).await?;
        t.advance(MutationStage::Snapshotted);

        let root_change = self
            .roots
            .contains(&fs_path)
            .then(|| RootChange::Removed(fs_path.clone()));
        Ok(t.complete(path.clone(), false, warnings, snapshot, root_change))
    }

    /// Re-crawl every root, reconcile the vector store, publish the new tree.
    /// Roots that vanished from disk are dropped from the tree and reported.
    pub async fn refresh(&self, progress: &IndexProgress) -> TreeResult<RefreshReport> {
        let (present, vanished): (Vec<PathBuf>, Vec<PathBuf>) =
            self.roots.iter().cloned().partition(|root| root.is_dir());
        for root in &vanished {
            warn!(root = %root.display(), "indexed root is gone, dropping it");
        }

        let output = crawl_blocking(present, self.crawl.clone()).await?;
        let crawl_errors = output.errors.clone();
        let graph = TreeGraph::from_snapshot(output.into_snapshot())?;

        let stored = stored_records(self.vectors).await?;
        let files: Vec<&TreeNode> = graph.nodes().filter(|n| n.is_content_file()).collect();
        let live: HashSet<&str> = files.iter().map(|n| n.absolute_path.as_str()).collect();
        let stale = stale_paths(&stored, &live);

        let to_index: Vec<TreeNode> = files
            .into_iter()
            .filter(|n| ContentKind::from_extension(&n.extension).is_some())
            .filter(|n| {
                let current = n.modified_at.as_ref().map(timestamp_key);
                stored.get(n.absolute_path.as_str()) != Some(&current)
            })
            .cloned()
            .collect();

        info!(purge = stale.len(), index = to_index.len(), "reconciling content index");
        self.vectors.delete_paths(&stale).await?;
        let summary = self.content.index_many(to_index, progress).await;

        let snapshot = graph.to_snapshot();
        self.store.replace(graph);

        Ok(RefreshReport {
            purged: stale.len(),
            summary,
            crawl_errors,
            removed_roots: vanished,
            snapshot,
        })
    }

    async fn remove_from_disk(&self, node: &TreeNode, fs_path: &Path) -> TreeResult<()> {
        if self.delete_mode == DeleteMode::Trash {
            tokio::fs::create_dir_all(self.trash_dir)
                .await
                .map_err(|e| TreeError::fs("create trash", self.trash_dir, e))?;
            let dest = self
                .trash_dir
                .join(format!("{}-{}", Uuid::new_v4(), node.display_name));
            match tokio::fs::rename(fs_path, &dest).await {
                Ok(()) => {
                    debug!(from = %fs_path.display(), to = %dest.display(), "moved to trash");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %fs_path.display(), "already gone from disk");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                    info!(path = %fs_path.display(), "trash is on another device, deleting");
                }
                Err(e) => return Err(TreeError::fs("move to trash", fs_path, e)),
            }
        }

        let result = if node.is_directory {
            tokio::fs::remove_dir_all(fs_path).await
        } else {
            tokio::fs::remove_file(fs_path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %fs_path.display(), "already gone from disk");
                Ok(())
            }
            Err(e) => Err(TreeError::fs("delete", fs_path, e)),
        }
    }

    /// Scoped crawl of a directory node, for `Patch::Replaced`.
    async fn rescan(&self, dir: &TreeNode) -> TreeResult<Vec<TreeNode>> {
        let path = dir.absolute_path.to_fs_path();
        let parent = dir.parent_id;
        let options = self.crawl.clone();
        let output = blocking(move || crawl_subtree(&path, parent, &options)).await?;
        Ok(output.nodes)
    }

    /// Patch the tree. If the patch does not fit (the tree drifted from what
    /// the mutation expected), rebuild from disk instead.
    async fn publish(&self, patches: Vec<Patch>) -> TreeResult<TreeSnapshot> {
        match self.store.apply(patches) {
            Ok(graph) => Ok(graph.to_snapshot()),
            Err(e) => {
                warn!(error = %e, "patch rejected, rebuilding tree from disk");
                let roots: Vec<PathBuf> = self.roots.iter().filter(|r| r.is_dir()).cloned().collect();
                let output = crawl_blocking(roots, self.crawl.clone()).await?;
                let graph = TreeGraph::from_snapshot(output.into_snapshot())?;
                let snapshot = graph.to_snapshot();
                self.store.replace(graph);
                Ok(snapshot)
            }
        }
    }
}

/// Keep the original extension when a file is renamed without one.
pub fn effective_name(node: &TreeNode, new_name: &str) -> String {
    if node.is_directory || !extension_of(new_name).is_empty() || node.extension.is_empty() {
        return new_name.to_string();
    }
    match node.display_name.rsplit_once('.') {
        Some((_, ext)) => format!("{new_name}.{ext}"),
        None => new_name.to_string(),
    }
}

/// Remove a folder this mutation just created after a later step failed, so
/// the disk matches the unchanged tree.
async fn undo_create(fs_path: &Path, cause: io::Error) -> TreeError {
    if let Err(e) = tokio::fs::remove_dir(fs_path).await {
        warn!(path = %fs_path.display(), error = %e, "could not remove folder after failed create");
    }
    TreeError::fs("stat new folder", fs_path, cause)
}

/// Every stored record path, mapped to the modification time it was indexed at.
pub(crate) async fn stored_records(vectors: &VectorStore) -> TreeResult<HashMap<String, Option<String>>> {
    let mut stored = HashMap::new();
    for modality in crate::types::Modality::ALL {
        for entry in vectors.entries(modality).await? {
            stored.insert(entry.path, entry.modified_at);
        }
    }
    Ok(stored)
}

/// Stored record paths that are not live content files.
pub(crate) fn stale_paths(stored: &HashMap<String, Option<String>>, live: &HashSet<&str>) -> Vec<FlatKey> {
    let mut stale = Vec::new();
    for path in stored.keys().filter(|p| !live.contains(p.as_str())) {
        match FlatKey::parse(path) {
            Ok(key) => stale.push(key),
            Err(e) => warn!(path = %path, error = %e, "ignoring unparseable record path"),
        }
    }
    stale.sort();
    stale
}

fn placeholder(path: &FlatKey) -> TreeError {
    TreeError::NotIndexed(format!("{path} is a placeholder directory"))
}

/// Run blocking work (crawls) off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> TreeResult<T>
where
    F: FnOnce() -> TreeResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TreeError::Store(anyhow::Error::new(e).context("blocking task failed")))?
}

pub(crate) async fn crawl_blocking(
    roots: Vec<PathBuf>,
    options: CrawlOptions,
) -> TreeResult<crate::crawler::CrawlOutput> {
    blocking(move || crawl_roots(&roots, &options)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, is_directory: bool) -> TreeNode {
        let key = FlatKey::parse(&format!("/|r|{name}")).unwrap();
        let mut node = TreeNode::synthetic(key, None);
        node.is_synthetic = false;
        node.is_directory = is_directory;
        if !is_directory {
            node.extension = extension_of(name);
        }
        node
    }

    #[test]
    fn test_effective_name_keeps_file_extension() {
        assert_eq!(effective_name(&node("report.PDF", false), "final"), "final.PDF");
        assert_eq!(effective_name(&node("report.pdf", false), "final.txt"), "final.txt");
        assert_eq!(effective_name(&node("Makefile", false), "Build"), "Build");
        assert_eq!(effective_name(&node("photos.2024", true), "pics"), "pics");
    }

    #[test]
    fn test_stage_tracker() {
        let mut t = Tracker::start(MutationKind::Delete, &"x");
        assert_eq!(t.stage, MutationStage::Requested);
        t.advance(MutationStage::Validated);
        let err = t.reject(TreeError::NotIndexed("x".into()));
        assert_eq!(t.stage, MutationStage::Rejected);
        assert!(matches!(err, TreeError::NotIndexed(_)));
    }

    #[tokio::test]
    async fn test_undo_create_removes_folder_and_names_it() {
        let dir = tempfile::tempdir().unwrap();
        let created = dir.path().join("fresh");
        std::fs::create_dir(&created).unwrap();

        let err = undo_create(&created, io::Error::from(io::ErrorKind::PermissionDenied)).await;
        assert!(!created.exists());
        match err {
            TreeError::FileSystem { path, .. } => assert_eq!(path, created),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stale_paths_skips_live_and_unparseable() {
        let stored: HashMap<String, Option<String>> = [
            ("/|r|keep.txt".to_string(), None),
            ("/|r|gone.txt".to_string(), None),
            ("/|r|bad\\escape".to_string(), None),
        ]
        .into_iter()
        .collect();
        let live: HashSet<&str> = ["/|r|keep.txt"].into_iter().collect();

        let stale = stale_paths(&stored, &live);
        assert_eq!(stale, vec![FlatKey::parse("/|r|gone.txt").unwrap()]);
    }
}
