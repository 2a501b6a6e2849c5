//! Tree service: the operations exposed by the CLI and the MCP server.
//!
//! Writes (index, refresh, mutations, clear) are serialized through one async
//! writer lane held from validation until the new snapshot is persisted and
//! published. Reads go straight to the current graph.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::config::LocalConfig;
use super::content::{ContentIndexer, IndexProgress, IndexSummary, ProgressSnapshot};
use super::embed::Embedder;
use super::manifest::IndexManifest;
use super::mutation::{
    MutationHandler, MutationOutcome, RefreshReport, RootChange, crawl_blocking, stale_paths,
    stored_records,
};
use super::search::SearchResolver;
use super::snapshot::{read_snapshot, remove_snapshot, write_snapshot};
use super::store::{TreeGraph, TreeStore};
use super::vector::VectorStore;
use crate::crawler::{CrawlIssue, CrawlOptions};
use crate::types::{
    FlatKey, Modality, NodeId, PathError, SearchResponse, SnapshotMetadata, TreeError, TreeNode,
    TreeResult, TreeSnapshot,
};

const TRASH_DIR: &str = "trash";

/// Overrides for a `run_index` call; unset fields keep the manifest's values.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub db_path: Option<PathBuf>,
    pub table_name: Option<String>,
    pub output_path: Option<PathBuf>,
    pub synthesize_ancestors: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub roots: Vec<PathBuf>,
    pub summary: IndexSummary,
    pub crawl_errors: Vec<CrawlIssue>,
    pub snapshot: TreeSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    pub index_dir: PathBuf,
    pub roots: Vec<PathBuf>,
    pub db_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub table_name: String,
    pub tree: SnapshotMetadata,
    pub text_records: usize,
    pub image_records: usize,
}

/// Owned pieces a write operation works with while it holds the lane.
struct WriteContext<E> {
    manifest: IndexManifest,
    vectors: Arc<VectorStore>,
    content: ContentIndexer<E>,
    crawl: CrawlOptions,
    trash_dir: PathBuf,
}

pub struct TreeService<E> {
    index_dir: PathBuf,
    config: LocalConfig,
    embedder: Arc<E>,
    store: TreeStore,
    vectors: RwLock<Arc<VectorStore>>,
    manifest: RwLock<IndexManifest>,
    lane: Mutex<()>,
    progress: Arc<IndexProgress>,
}

impl<E: Embedder> TreeService<E> {
    /// Open the index at `index_dir`. A saved snapshot is loaded eagerly; a
    /// missing or unreadable one is rebuilt on first access.
    pub async fn open(index_dir: &Path, config: LocalConfig, embedder: Arc<E>) -> anyhow::Result<Self> {
        let manifest = IndexManifest::load_or_default(index_dir, &config.table_name)?;
        let vectors = VectorStore::open(&manifest.db_path, &manifest.table_name).await?;

        let store = TreeStore::new();
        match read_snapshot(&manifest.snapshot_path) {
            Ok(Some(snapshot)) => {
                if let Err(e) = store.load(snapshot) {
                    warn!(path = %manifest.snapshot_path.display(), error = %e, "discarding invalid snapshot");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "discarding unreadable snapshot"),
        }

        Ok(Self {
            index_dir: index_dir.to_path_buf(),
            config,
            embedder,
            store,
            vectors: RwLock::new(Arc::new(vectors)),
            manifest: RwLock::new(manifest),
            lane: Mutex::new(()),
            progress: Arc::new(IndexProgress::default()),
        })
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    pub fn manifest(&self) -> IndexManifest {
        self.manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn vectors(&self) -> Arc<VectorStore> {
        self.vectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Current tree, rebuilt from the manifest roots if nothing is loaded.
    pub async fn get_tree(&self) -> TreeResult<TreeSnapshot> {
        Ok(self.graph().await?.to_snapshot())
    }

    pub fn children(&self, id: NodeId) -> Vec<TreeNode> {
        self.store.children(id)
    }

    pub fn resolve(&self, path: &FlatKey) -> Option<TreeNode> {
        self.store.resolve(path)
    }

    async fn graph(&self) -> TreeResult<Arc<TreeGraph>> {
        let graph = self.store.current();
        if !graph.is_empty() {
            return Ok(graph);
        }
        let _lane = self.lane.lock().await;
        self.load_tree().await
    }

    /// Rebuild the tree from disk when it is empty and roots are known.
    /// Caller holds the lane.
    async fn load_tree(&self) -> TreeResult<Arc<TreeGraph>> {
        let graph = self.store.current();
        let manifest = self.manifest();
        if !graph.is_empty() || manifest.roots.is_empty() {
            return Ok(graph);
        }

        info!(roots = manifest.roots.len(), "no snapshot loaded, rebuilding from disk");
        let crawl = self.crawl_options(manifest.synthesize_ancestors)?;
        let output = crawl_blocking(manifest.roots.clone(), crawl).await?;
        let graph = TreeGraph::from_snapshot(output.into_snapshot())?;
        write_snapshot(&manifest.snapshot_path, &graph.to_snapshot())?;
        self.store.replace(graph);
        Ok(self.store.current())
    }

    fn crawl_options(&self, synthesize_ancestors: bool) -> TreeResult<CrawlOptions> {
        let options = CrawlOptions::new(&self.config.exclude, self.config.include_hidden)
            .context("Invalid exclude pattern in config")?;
        Ok(options
            .with_synthesized_ancestors(synthesize_ancestors)
            .skipping(&self.index_dir))
    }

    fn content_indexer(&self, vectors: Arc<VectorStore>) -> ContentIndexer<E> {
        ContentIndexer::new(
            self.embedder.clone(),
            vectors,
            self.config.max_file_bytes,
            self.config.embed_concurrency,
        )
    }

    fn write_context(&self) -> TreeResult<WriteContext<E>> {
        let manifest = self.manifest();
        let vectors = self.vectors();
        Ok(WriteContext {
            crawl: self.crawl_options(manifest.synthesize_ancestors)?,
            content: self.content_indexer(vectors.clone()),
            trash_dir: self.index_dir.join(TRASH_DIR),
            manifest,
            vectors,
        })
    }

    fn handler<'a>(&'a self, cx: &'a WriteContext<E>) -> MutationHandler<'a, E> {
        MutationHandler {
            store: &self.store,
            vectors: &cx.vectors,
            content: &cx.content,
            crawl: &cx.crawl,
            roots: &cx.manifest.roots,
            delete_mode: self.config.delete_mode,
            trash_dir: &cx.trash_dir,
        }
    }

    /// Crawl `roots`, replace the content index with their files and publish
    /// the new tree.
    pub async fn run_index(&self, roots: &[PathBuf], options: IndexOptions) -> TreeResult<IndexReport> {
        if roots.is_empty() {
            return Err(PathError::Empty.into());
        }
        let _lane = self.lane.lock().await;
        self.progress.reset();

        let canonical = roots
            .iter()
            .map(|root| {
                std::fs::canonicalize(root).map_err(|source| TreeError::Crawl {
                    root: root.clone(),
                    source,
                })
            })
            .collect::<TreeResult<Vec<_>>>()?;

        let current = self.manifest();
        let mut manifest = current.clone();
        if let Some(db_path) = options.db_path {
            manifest.db_path = db_path;
        }
        if let Some(table_name) = options.table_name {
            manifest.table_name = table_name;
        }
        if let Some(output_path) = options.output_path {
            manifest.snapshot_path = output_path;
        }
        manifest.synthesize_ancestors = options.synthesize_ancestors;

        info!(roots = ?canonical, "indexing");
        let crawl = self.crawl_options(manifest.synthesize_ancestors)?;
        let output = crawl_blocking(canonical.clone(), crawl).await?;
        let crawl_errors = output.errors.clone();
        let graph = TreeGraph::from_snapshot(output.into_snapshot())?;

        // Records are replaced path by path and stale ones purged only after
        // indexing; nothing is dropped before the new tree is ready to publish.
        let previous = self.vectors();
        let same_store =
            current.db_path == manifest.db_path && current.table_name == manifest.table_name;
        let vectors = if same_store {
            previous.clone()
        } else {
            Arc::new(VectorStore::open(&manifest.db_path, &manifest.table_name).await?)
        };

        let files: Vec<TreeNode> = graph.nodes().filter(|n| n.is_content_file()).cloned().collect();
        let summary = self
            .content_indexer(vectors.clone())
            .index_many(files, &self.progress)
            .await;

        let stored = stored_records(&vectors).await?;
        let stale = {
            let live: HashSet<&str> = graph
                .nodes()
                .filter(|n| n.is_content_file())
                .map(|n| n.absolute_path.as_str())
                .collect();
            stale_paths(&stored, &live)
        };
        vectors.delete_paths(&stale).await?;

        let snapshot = graph.to_snapshot();
        write_snapshot(&manifest.snapshot_path, &snapshot)?;
        self.store.replace(graph);

        manifest.roots = canonical;
        manifest.save(&self.index_dir)?;
        *self.vectors.write().unwrap_or_else(PoisonError::into_inner) = vectors;
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = manifest.clone();
        if !same_store {
            if let Err(e) = previous.clear().await {
                warn!(error = %format!("{e:#}"), "failed to drop the previous vector tables");
            }
        }

        info!(
            nodes = snapshot.metadata.total_nodes,
            indexed = summary.indexed,
            failures = summary.failures.len(),
            "index complete"
        );
        Ok(IndexReport {
            roots: manifest.roots,
            summary,
            crawl_errors,
            snapshot,
        })
    }

    /// Re-crawl all roots and reconcile the content index with disk.
    pub async fn refresh(&self) -> TreeResult<RefreshReport> {
        let _lane = self.lane.lock().await;
        let cx = self.write_context()?;
        if cx.manifest.roots.is_empty() {
            return Err(TreeError::NotIndexed("no roots indexed yet".into()));
        }
        self.progress.reset();
        let report = self.handler(&cx).refresh(&self.progress).await?;
        write_snapshot(&cx.manifest.snapshot_path, &report.snapshot)?;
        let changes: Vec<RootChange> = report
            .removed_roots
            .iter()
            .cloned()
            .map(RootChange::Removed)
            .collect();
        self.update_roots(cx.manifest, &changes)?;
        Ok(report)
    }

    pub async fn create_folder(&self, parent: &FlatKey, name: &str) -> TreeResult<MutationOutcome> {
        let _lane = self.lane.lock().await;
        self.load_tree().await?;
        let cx = self.write_context()?;
        let outcome = self.handler(&cx).create_folder(parent, name).await?;
        self.persist(cx.manifest, &outcome)?;
        Ok(outcome)
    }

    pub async fn rename(&self, old: &FlatKey, new_name: &str) -> TreeResult<MutationOutcome> {
        let _lane = self.lane.lock().await;
        self.load_tree().await?;
        let cx = self.write_context()?;
        let outcome = self.handler(&cx).rename(old, new_name).await?;
        self.persist(cx.manifest, &outcome)?;
        Ok(outcome)
    }

    pub async fn delete(&self, path: &FlatKey) -> TreeResult<MutationOutcome> {
        let _lane = self.lane.lock().await;
        self.load_tree().await?;
        let cx = self.write_context()?;
        let outcome = self.handler(&cx).delete(path).await?;
        self.persist(cx.manifest, &outcome)?;
        Ok(outcome)
    }

    /// Write the outcome's snapshot and follow any change to the root list.
    fn persist(&self, manifest: IndexManifest, outcome: &MutationOutcome) -> TreeResult<()> {
        if !outcome.existed {
            write_snapshot(&manifest.snapshot_path, &outcome.snapshot)?;
        }
        self.update_roots(manifest, outcome.root_change.as_slice())
    }

    fn update_roots(&self, mut manifest: IndexManifest, changes: &[RootChange]) -> TreeResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        for change in changes {
            match change {
                RootChange::Renamed { from, to } => {
                    for root in manifest.roots.iter_mut().filter(|r| *r == from) {
                        *root = to.clone();
                    }
                }
                RootChange::Removed(path) => manifest.roots.retain(|r| r != path),
            }
        }
        info!(roots = ?manifest.roots, "root list changed");
        manifest.save(&self.index_dir)?;
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = manifest;
        Ok(())
    }

    /// Drop both vector tables, the snapshot and the manifest.
    pub async fn clear_all(&self) -> TreeResult<()> {
        let _lane = self.lane.lock().await;
        let manifest = self.manifest();

        self.vectors().clear().await?;
        remove_snapshot(&manifest.snapshot_path)?;
        IndexManifest::remove(&self.index_dir)?;
        self.store.replace(TreeGraph::default());

        let fresh = IndexManifest::new(&self.index_dir, &self.config.table_name);
        let vectors = VectorStore::open(&fresh.db_path, &fresh.table_name).await?;
        *self.vectors.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(vectors);
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!(index_dir = %self.index_dir.display(), "index cleared");
        Ok(())
    }

    /// Similarity search in one modality; `limit` defaults to the config.
    pub async fn search(
        &self,
        query: &str,
        modality: Modality,
        limit: Option<usize>,
    ) -> TreeResult<SearchResponse> {
        let graph = self.graph().await?;
        let vectors = self.vectors();
        let resolver = SearchResolver {
            embedder: self.embedder.as_ref(),
            vectors: &vectors,
        };
        resolver
            .search(&graph, query, modality, limit.unwrap_or(self.config.search_limit))
            .await
    }

    pub async fn stats(&self) -> TreeResult<TreeStats> {
        let manifest = self.manifest();
        let vectors = self.vectors();
        Ok(TreeStats {
            index_dir: self.index_dir.clone(),
            tree: self.store.current().metadata(),
            text_records: vectors.count(Modality::Text).await?,
            image_records: vectors.count(Modality::Image).await?,
            roots: manifest.roots,
            db_path: manifest.db_path,
            snapshot_path: manifest.snapshot_path,
            table_name: manifest.table_name,
        })
    }
}
