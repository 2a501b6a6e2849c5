use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use super::options::CrawlOptions;
use crate::types::{
    FlatKey, HierPath, NodeId, PathError, TreeError, TreeNode, TreeResult, TreeSnapshot,
    sibling_order,
};

/// An entry the crawler could not turn into a node.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlIssue {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug)]
pub enum CrawlStep {
    Node(TreeNode),
    Skipped(CrawlIssue),
}

/// Nodes of one or more crawled roots.
#[derive(Debug, Default)]
pub struct CrawlOutput {
    pub nodes: Vec<TreeNode>,
    /// Parent id to children in canonical order. Parents outside the crawl
    /// (scoped crawls) appear as keys too.
    pub adjacency: BTreeMap<NodeId, Vec<NodeId>>,
    /// Parentless nodes in crawl order.
    pub root_ids: Vec<NodeId>,
    pub errors: Vec<CrawlIssue>,
}

impl CrawlOutput {
    fn from_steps(steps: CrawlSteps) -> Self {
        let mut output = Self::default();
        for step in steps {
            match step {
                CrawlStep::Node(node) => output.nodes.push(node),
                CrawlStep::Skipped(issue) => output.errors.push(issue),
            }
        }
        output.finish();
        output
    }

    fn merge(&mut self, other: CrawlOutput) {
        let known: HashSet<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        self.nodes
            .extend(other.nodes.into_iter().filter(|n| !known.contains(&n.id)));
        self.errors.extend(other.errors);
        self.finish();
    }

    fn finish(&mut self) {
        let by_id: HashMap<NodeId, &TreeNode> = self.nodes.iter().map(|n| (n.id, n)).collect();

        let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for node in &self.nodes {
            if let Some(parent) = node.parent_id {
                adjacency.entry(parent).or_default().push(node.id);
            }
        }
        for children in adjacency.values_mut() {
            children.sort_by(|a, b| sibling_order(by_id[a], by_id[b]));
        }

        self.root_ids = self
            .nodes
            .iter()
            .filter(|n| n.parent_id.is_none())
            .map(|n| n.id)
            .collect();
        self.adjacency = adjacency;
    }

    pub fn into_snapshot(self) -> TreeSnapshot {
        TreeSnapshot::assemble(self.nodes, self.root_ids)
    }
}

/// Step iterator over one root. Yields synthetic ancestors first (when
/// requested), then the root and its descendants depth-first.
pub struct CrawlSteps {
    entries: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>,
    root_parent: Option<NodeId>,
    pending: VecDeque<TreeNode>,
}

impl CrawlSteps {
    /// Start a crawl of `root`. `parent` attaches the root under an existing
    /// node instead of making it a tree root.
    pub fn new(root: &Path, options: &CrawlOptions, parent: Option<NodeId>) -> TreeResult<Self> {
        let canonical = canonical_dir(root)?;
        let root_key = HierPath::from_fs_path(&canonical)?;

        let mut pending = VecDeque::new();
        let mut root_parent = parent;
        if parent.is_none() && options.synthesize_ancestors {
            for ancestor in root_key.ancestors() {
                let node = TreeNode::synthetic(ancestor.encode(), root_parent);
                root_parent = Some(node.id);
                pending.push_back(node);
            }
        }

        let filter = options.clone();
        let entries = WalkDir::new(&canonical)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| e.depth() == 0 || !filter.excludes(e));

        Ok(Self {
            entries: Box::new(entries),
            root_parent,
            pending,
        })
    }

    fn node_for(&self, entry: &DirEntry) -> Result<TreeNode, CrawlIssue> {
        let issue = |error: String| CrawlIssue {
            path: entry.path().to_path_buf(),
            error,
        };

        let key = FlatKey::from_fs_path(entry.path()).map_err(|e| issue(e.to_string()))?;
        let metadata = entry.metadata().map_err(|e| issue(e.to_string()))?;
        let parent_id = if entry.depth() == 0 {
            self.root_parent
        } else {
            key.parent().map(|p| NodeId::for_key(&p))
        };

        Ok(TreeNode::from_metadata(key, parent_id, &metadata))
    }
}

impl Iterator for CrawlSteps {
    type Item = CrawlStep;

    fn next(&mut self) -> Option<CrawlStep> {
        if let Some(node) = self.pending.pop_front() {
            return Some(CrawlStep::Node(node));
        }

        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    return Some(CrawlStep::Skipped(CrawlIssue {
                        path,
                        error: err.to_string(),
                    }));
                }
            };

            if entry.file_type().is_symlink() {
                debug!(path = %entry.path().display(), "skipping symlink");
                continue;
            }

            return Some(match self.node_for(&entry) {
                Ok(node) => CrawlStep::Node(node),
                Err(issue) => {
                    warn!(path = %issue.path.display(), error = %issue.error, "skipping entry");
                    CrawlStep::Skipped(issue)
                }
            });
        }
    }
}

/// Crawl a single root into a fresh forest.
pub fn crawl(root: &Path, options: &CrawlOptions) -> TreeResult<CrawlOutput> {
    info!(root = %root.display(), "crawling");
    let output = CrawlOutput::from_steps(CrawlSteps::new(root, options, None)?);
    info!(
        root = %root.display(),
        nodes = output.nodes.len(),
        errors = output.errors.len(),
        "crawl complete"
    );
    Ok(output)
}

/// Crawl several roots into one forest. Roots must not contain each other.
pub fn crawl_roots(roots: &[PathBuf], options: &CrawlOptions) -> TreeResult<CrawlOutput> {
    let canonical = roots
        .iter()
        .map(|r| canonical_dir(r))
        .collect::<TreeResult<Vec<_>>>()?;
    for (i, a) in canonical.iter().enumerate() {
        for b in &canonical[i + 1..] {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(PathError::OverlappingRoots(
                    a.display().to_string(),
                    b.display().to_string(),
                )
                .into());
            }
        }
    }

    let mut output = CrawlOutput::default();
    for root in &canonical {
        output.merge(crawl(root, options)?);
    }
    Ok(output)
}

/// Re-crawl `dir` as a child of `parent` (or as a root when `parent` is None).
pub fn crawl_subtree(
    dir: &Path,
    parent: Option<NodeId>,
    options: &CrawlOptions,
) -> TreeResult<CrawlOutput> {
    debug!(dir = %dir.display(), "scoped crawl");
    let options = CrawlOptions {
        synthesize_ancestors: false,
        ..options.clone()
    };
    Ok(CrawlOutput::from_steps(CrawlSteps::new(
        dir, &options, parent,
    )?))
}

fn canonical_dir(root: &Path) -> TreeResult<PathBuf> {
    let crawl_error = |source: io::Error| TreeError::Crawl {
        root: root.to_path_buf(),
        source,
    };

    let canonical = fs::canonicalize(root).map_err(crawl_error)?;
    let metadata = fs::metadata(&canonical).map_err(crawl_error)?;
    if !metadata.is_dir() {
        return Err(crawl_error(io::Error::new(
            io::ErrorKind::NotADirectory,
            "not a directory",
        )));
    }
    fs::read_dir(&canonical).map_err(crawl_error)?;
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options() -> CrawlOptions {
        CrawlOptions::new(&[".git".to_string()], true).unwrap()
    }

    fn names(output: &CrawlOutput, parent: NodeId) -> Vec<String> {
        let by_id: HashMap<NodeId, &TreeNode> = output.nodes.iter().map(|n| (n.id, n)).collect();
        output.adjacency[&parent]
            .iter()
            .map(|id| by_id[id].display_name.clone())
            .collect()
    }

    #[test]
    fn test_empty_directory_yields_single_root() {
        let dir = tempdir().unwrap();
        let output = crawl(dir.path(), &options()).unwrap();

        assert_eq!(output.nodes.len(), 1);
        assert_eq!(output.root_ids, vec![output.nodes[0].id]);
        assert!(output.adjacency.is_empty());
        assert!(output.errors.is_empty());

        let snapshot = output.into_snapshot();
        assert_eq!(snapshot.metadata.total_nodes, 1);
        assert_eq!(snapshot.metadata.total_directories, 1);
        snapshot.check_invariants().unwrap();
    }

    #[test]
    fn test_nested_tree_structure_and_order() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs/drafts")).unwrap();
        fs::create_dir(dir.path().join("Archive")).unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("A.md"), "a").unwrap();
        fs::write(dir.path().join("docs/q3|notes.txt"), "q3").unwrap();

        let output = crawl(dir.path(), &options()).unwrap();
        assert_eq!(output.nodes.len(), 7);

        let root = output.root_ids[0];
        assert_eq!(names(&output, root), ["Archive", "docs", "A.md", "b.txt"]);

        let docs = output
            .nodes
            .iter()
            .find(|n| n.display_name == "docs")
            .unwrap();
        assert_eq!(names(&output, docs.id), ["drafts", "q3|notes.txt"]);

        let notes = output
            .nodes
            .iter()
            .find(|n| n.display_name == "q3|notes.txt")
            .unwrap();
        assert!(notes.absolute_path.as_str().ends_with("docs|q3\\|notes.txt"));
        assert_eq!(notes.extension, "txt");
        assert_eq!(notes.size_bytes, Some(2));
        assert_eq!(notes.parent_id, Some(docs.id));

        output.into_snapshot().check_invariants().unwrap();
    }

    #[test]
    fn test_ids_are_stable_across_crawls() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file.txt"), "x").unwrap();

        let first = crawl(dir.path(), &options()).unwrap().into_snapshot();
        let second = crawl(dir.path(), &options()).unwrap().into_snapshot();
        assert_eq!(first, second);
    }

    #[test]
    fn test_synthesized_ancestors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let output = crawl(dir.path(), &options().with_synthesized_ancestors(true)).unwrap();
        let canonical = fs::canonicalize(dir.path()).unwrap();
        let depth = HierPath::from_fs_path(&canonical).unwrap().len();

        // ancestors + root + file
        assert_eq!(output.nodes.len(), depth + 1);
        assert_eq!(output.root_ids.len(), 1);

        let top = output.nodes.iter().find(|n| n.id == output.root_ids[0]).unwrap();
        assert!(top.is_synthetic);
        assert!(top.size_bytes.is_none());
        assert!(top.modified_at.is_none());

        let snapshot = output.into_snapshot();
        assert_eq!(snapshot.metadata.synthetic_directories, depth - 1);
        snapshot.check_invariants().unwrap();
    }

    #[test]
    fn test_exclusions_and_hidden_entries() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(dir.path().join(".env"), "x").unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();
        fs::write(dir.path().join("scratch.tmp"), "x").unwrap();

        let with_hidden = CrawlOptions::new(&[".git".to_string(), "*.tmp".to_string()], true).unwrap();
        let output = crawl(dir.path(), &with_hidden).unwrap();
        let root = output.root_ids[0];
        assert_eq!(names(&output, root), [".env", "keep.txt"]);

        let no_hidden = CrawlOptions::new(&[], false).unwrap();
        let output = crawl(dir.path(), &no_hidden).unwrap();
        let root = output.root_ids[0];
        assert_eq!(names(&output, root), ["keep.txt", "scratch.tmp"]);
    }

    #[test]
    fn test_skip_paths_exclude_index_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("store")).unwrap();
        fs::write(dir.path().join("store/tree.json"), "{}").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let options = options().skipping(&dir.path().join("store"));
        let output = crawl(dir.path(), &options).unwrap();
        assert_eq!(output.nodes.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), "a").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let output = crawl(dir.path(), &options()).unwrap();
        assert_eq!(output.nodes.len(), 2);
        assert!(output.nodes.iter().all(|n| n.display_name != "link.txt"));
    }

    #[test]
    fn test_root_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            crawl(&missing, &options()),
            Err(TreeError::Crawl { .. })
        ));

        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            crawl(&file, &options()),
            Err(TreeError::Crawl { .. })
        ));
    }

    #[test]
    fn test_crawl_roots_builds_forest_and_rejects_overlap() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        fs::write(a.path().join("one.txt"), "1").unwrap();
        fs::write(b.path().join("two.txt"), "2").unwrap();

        let roots = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let output = crawl_roots(&roots, &options()).unwrap();
        assert_eq!(output.root_ids.len(), 2);
        assert_eq!(output.nodes.len(), 4);
        output.into_snapshot().check_invariants().unwrap();

        fs::create_dir(a.path().join("inner")).unwrap();
        let nested = vec![a.path().to_path_buf(), a.path().join("inner")];
        assert!(matches!(
            crawl_roots(&nested, &options()),
            Err(TreeError::InvalidPath(PathError::OverlappingRoots(_, _)))
        ));
    }

    #[test]
    fn test_crawl_roots_shares_synthetic_ancestors() {
        let parent = tempdir().unwrap();
        fs::create_dir(parent.path().join("a")).unwrap();
        fs::create_dir(parent.path().join("b")).unwrap();

        let roots = vec![parent.path().join("a"), parent.path().join("b")];
        let options = options().with_synthesized_ancestors(true);
        let output = crawl_roots(&roots, &options).unwrap();
        assert_eq!(output.root_ids.len(), 1);
        output.into_snapshot().check_invariants().unwrap();
    }

    #[test]
    fn test_crawl_subtree_attaches_to_parent() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/x.txt"), "x").unwrap();

        let full = crawl(dir.path(), &options()).unwrap();
        let root = full.root_ids[0];
        let scoped = crawl_subtree(&dir.path().join("sub"), Some(root), &options()).unwrap();

        assert!(scoped.root_ids.is_empty());
        assert_eq!(scoped.nodes.len(), 2);
        assert_eq!(scoped.nodes[0].parent_id, Some(root));
        assert_eq!(names(&scoped, root), ["sub"]);
    }
}
