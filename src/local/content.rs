//! Content indexing.
//!
//! Orchestrates:
//! 1. Reading and extracting supported files (text or pixels)
//! 2. Generating embeddings
//! 3. Upserting one record per file into the vector store

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use image::RgbImage;
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::embed::{Embedder, l2_normalize, mean_pool};
use super::models::{IndexRecord, RecordMetadata};
use super::vector::VectorStore;
use crate::extract::{
    ContentKind, IndexError, MAX_CHUNKS, WORDS_PER_CHUNK, chunk_words, decode_image,
    extract_text, snippet,
};
use crate::types::{FlatKey, Modality, TreeNode, timestamp_key};

/// Files carried through extract, embed and upsert together. Bounds how much
/// extracted content is held in memory at once.
const FILE_BATCH: usize = 64;

type Extractor = fn(&TreeNode, u64) -> Result<Prepared, IndexError>;

/// Result of indexing a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed(Modality),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Directory,
    Synthetic,
    Unsupported,
    TooLarge,
    EmptyText,
}

/// Per-file failure during a bulk index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexFailure {
    pub path: FlatKey,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexSummary {
    pub indexed: usize,
    pub skipped: usize,
    pub failures: Vec<IndexFailure>,
}

/// Live counters for a running index.
#[derive(Debug, Default)]
pub struct IndexProgress {
    pub queued: AtomicUsize,
    pub extracted: AtomicUsize,
    pub indexed: AtomicUsize,
    pub failed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProgressSnapshot {
    pub queued: usize,
    pub extracted: usize,
    pub indexed: usize,
    pub failed: usize,
}

impl IndexProgress {
    pub fn reset(&self) {
        self.queued.store(0, Ordering::Relaxed);
        self.extracted.store(0, Ordering::Relaxed);
        self.indexed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            extracted: self.extracted.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Content ready to embed.
enum Extracted {
    Text {
        chunks: Vec<String>,
        metadata: RecordMetadata,
    },
    Image {
        image: RgbImage,
        metadata: RecordMetadata,
    },
}

enum Prepared {
    Skip(SkipReason),
    Ready(FlatKey, Extracted),
}

/// Content indexer service.
pub struct ContentIndexer<E> {
    embedder: Arc<E>,
    vectors: Arc<VectorStore>,
    max_file_bytes: u64,
    concurrency: usize,
    extract: Extractor,
}

impl<E: Embedder> ContentIndexer<E> {
    pub fn new(
        embedder: Arc<E>,
        vectors: Arc<VectorStore>,
        max_file_bytes: u64,
        concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            vectors,
            max_file_bytes,
            concurrency: concurrency.max(1),
            extract: prepare,
        }
    }

    /// Index one node. Directories, synthetic nodes and unsupported files are
    /// a successful no-op.
    pub async fn index_content(&self, node: &TreeNode) -> Result<IndexOutcome, IndexError> {
        let node = node.clone();
        let (extract, max) = (self.extract, self.max_file_bytes);
        let prepared = tokio::task::spawn_blocking(move || isolated(extract, &node, max))
            .await
            .map_err(|e| IndexError::Embeddings(e.into()))??;

        match prepared {
            Prepared::Skip(reason) => Ok(IndexOutcome::Skipped(reason)),
            Prepared::Ready(path, extracted) => {
                let record = self.embed(path, extracted).await?;
                let modality = record.modality;
                self.vectors
                    .upsert(vec![record])
                    .await
                    .map_err(|e| IndexError::Storage(format!("{e:#}")))?;
                Ok(IndexOutcome::Indexed(modality))
            }
        }
    }

    /// Index many nodes in batches of `FILE_BATCH`: extraction in parallel,
    /// embedding with bounded concurrency, one upsert per batch. Failures are
    /// collected per file.
    pub async fn index_many(&self, nodes: Vec<TreeNode>, progress: &IndexProgress) -> IndexSummary {
        let mut summary = IndexSummary::default();
        progress.queued.fetch_add(nodes.len(), Ordering::Relaxed);

        let mut pending = nodes.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<TreeNode> = pending.by_ref().take(FILE_BATCH).collect();
            self.index_batch(batch, progress, &mut summary).await;
        }

        summary.failures.sort_by(|a, b| a.path.cmp(&b.path));
        summary
    }

    async fn index_batch(
        &self,
        nodes: Vec<TreeNode>,
        progress: &IndexProgress,
        summary: &mut IndexSummary,
    ) {
        let (extract, max) = (self.extract, self.max_file_bytes);
        let paths: Vec<FlatKey> = nodes.iter().map(|n| n.absolute_path.clone()).collect();
        let prepared = match tokio::task::spawn_blocking(move || {
            nodes
                .par_iter()
                .map(|node| (node.absolute_path.clone(), isolated(extract, node, max)))
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                let error = format!("extraction task failed: {e}");
                progress.failed.fetch_add(paths.len(), Ordering::Relaxed);
                summary.failures.extend(paths.into_iter().map(|path| IndexFailure {
                    path,
                    error: error.clone(),
                }));
                return;
            }
        };

        let mut ready = Vec::new();
        for (path, result) in prepared {
            match result {
                Ok(Prepared::Skip(reason)) => {
                    debug!(path = %path, ?reason, "skipping");
                    summary.skipped += 1;
                }
                Ok(Prepared::Ready(path, extracted)) => {
                    progress.extracted.fetch_add(1, Ordering::Relaxed);
                    ready.push((path, extracted));
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "extraction failed");
                    progress.failed.fetch_add(1, Ordering::Relaxed);
                    summary.failures.push(IndexFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }
        if ready.is_empty() {
            return;
        }

        info!(files = ready.len(), "generating embeddings");
        let embedded: Vec<(FlatKey, Result<IndexRecord, IndexError>)> =
            futures::stream::iter(ready.into_iter().map(|(path, extracted)| async move {
                let result = self.embed(path.clone(), extracted).await;
                (path, result)
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut records = Vec::with_capacity(embedded.len());
        for (path, result) in embedded {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path, error = %e, "embedding failed");
                    progress.failed.fetch_add(1, Ordering::Relaxed);
                    summary.failures.push(IndexFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }
        if records.is_empty() {
            return;
        }

        let count = records.len();
        let written: Vec<FlatKey> = records.iter().map(|r| r.path.clone()).collect();
        match self.vectors.upsert(records).await {
            Ok(()) => {
                summary.indexed += count;
                progress.indexed.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(error = %error, count, "upsert failed");
                progress.failed.fetch_add(count, Ordering::Relaxed);
                summary.failures.extend(written.into_iter().map(|path| IndexFailure {
                    path,
                    error: error.clone(),
                }));
            }
        }
    }

    async fn embed(&self, path: FlatKey, extracted: Extracted) -> Result<IndexRecord, IndexError> {
        match extracted {
            Extracted::Text { chunks, metadata } => {
                let vectors = self.embedder.embed_texts(Modality::Text, &chunks).await?;
                Ok(IndexRecord {
                    path,
                    modality: Modality::Text,
                    vector: mean_pool(&vectors)?,
                    metadata,
                })
            }
            Extracted::Image { image, metadata } => {
                let vector = self.embedder.embed_image(&image).await?;
                Ok(IndexRecord {
                    path,
                    modality: Modality::Image,
                    vector: l2_normalize(vector),
                    metadata,
                })
            }
        }
    }
}

/// Run `extract` for one node, turning a panic inside a decoder into a
/// per-file extraction error.
fn isolated(extract: Extractor, node: &TreeNode, max_file_bytes: u64) -> Result<Prepared, IndexError> {
    catch_unwind(AssertUnwindSafe(|| extract(node, max_file_bytes))).unwrap_or_else(|payload| {
        let reason = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "extractor panicked".to_string()
        };
        warn!(path = %node.absolute_path, reason = %reason, "extractor panicked");
        Err(IndexError::extraction(
            &node.absolute_path.to_fs_path(),
            format!("panic: {reason}"),
        ))
    })
}

/// Read and extract one node. Runs on a blocking thread.
fn prepare(node: &TreeNode, max_file_bytes: u64) -> Result<Prepared, IndexError> {
    if node.is_synthetic {
        return Ok(Prepared::Skip(SkipReason::Synthetic));
    }
    if node.is_directory {
        return Ok(Prepared::Skip(SkipReason::Directory));
    }
    let Some(kind) = ContentKind::from_extension(&node.extension) else {
        return Ok(Prepared::Skip(SkipReason::Unsupported));
    };

    let fs_path: PathBuf = node.absolute_path.to_fs_path();
    let size = std::fs::metadata(&fs_path)
        .map_err(|source| IndexError::Read {
            path: fs_path.clone(),
            source,
        })?
        .len();
    if size > max_file_bytes {
        debug!(path = %fs_path.display(), size, "file too large to index");
        return Ok(Prepared::Skip(SkipReason::TooLarge));
    }

    let bytes = std::fs::read(&fs_path).map_err(|source| IndexError::Read {
        path: fs_path.clone(),
        source,
    })?;
    let metadata = |snippet: String, chunks: u32| RecordMetadata {
        name: node.display_name.clone(),
        extension: node.extension.clone(),
        content_hash: hex::encode(Sha256::digest(&bytes)),
        snippet,
        chunks,
        modified_at: node.modified_at.as_ref().map(timestamp_key),
    };

    let extracted = match kind.modality() {
        Modality::Image => Extracted::Image {
            image: decode_image(&fs_path, &bytes)?,
            metadata: metadata(String::new(), 1),
        },
        Modality::Text => {
            let text = extract_text(&fs_path, kind, &bytes)?;
            let chunks = chunk_words(&text, WORDS_PER_CHUNK, MAX_CHUNKS);
            if chunks.is_empty() {
                return Ok(Prepared::Skip(SkipReason::EmptyText));
            }
            Extracted::Text {
                metadata: metadata(snippet(&text), chunks.len() as u32),
                chunks,
            }
        }
    };

    Ok(Prepared::Ready(node.absolute_path.clone(), extracted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::embed::testing::HashEmbedder;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn file_node(dir: &TempDir, name: &str, contents: &[u8]) -> TreeNode {
        let path = fs::canonicalize(dir.path()).unwrap().join(name);
        fs::write(&path, contents).unwrap();
        let key = FlatKey::from_fs_path(&path).unwrap();
        TreeNode::from_metadata(key, None, &fs::metadata(&path).unwrap())
    }

    async fn indexer(dir: &TempDir, embedder: HashEmbedder) -> ContentIndexer<HashEmbedder> {
        let vectors = VectorStore::open(&dir.path().join("vectors"), "files")
            .await
            .unwrap();
        ContentIndexer::new(Arc::new(embedder), Arc::new(vectors), 1024 * 1024, 2)
    }

    #[tokio::test]
    async fn test_index_text_file() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let indexer = indexer(&store, HashEmbedder::default()).await;

        let node = file_node(&files, "notes.txt", b"quarterly revenue report");
        let outcome = indexer.index_content(&node).await.unwrap();
        assert_eq!(outcome, IndexOutcome::Indexed(Modality::Text));

        let records = indexer
            .vectors
            .records(Modality::Text, &[node.absolute_path.clone()])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata.snippet, "quarterly revenue report");
        assert_eq!(records[0].metadata.chunks, 1);
        assert_eq!(records[0].metadata.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_index_is_idempotent() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let indexer = indexer(&store, HashEmbedder::default()).await;

        let node = file_node(&files, "notes.md", b"# Title\n\nsome body text");
        indexer.index_content(&node).await.unwrap();
        let first = indexer
            .vectors
            .records(Modality::Text, &[node.absolute_path.clone()])
            .await
            .unwrap();
        indexer.index_content(&node).await.unwrap();
        let second = indexer
            .vectors
            .records(Modality::Text, &[node.absolute_path.clone()])
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(indexer.vectors.count(Modality::Text).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_and_directories_are_noops() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let embedder = HashEmbedder::default();
        let indexer = indexer(&store, embedder).await;

        let binary = file_node(&files, "tool.exe", b"\x00\x01");
        assert_eq!(
            indexer.index_content(&binary).await.unwrap(),
            IndexOutcome::Skipped(SkipReason::Unsupported)
        );

        let root = fs::canonicalize(files.path()).unwrap();
        let dir = TreeNode::from_metadata(
            FlatKey::from_fs_path(&root).unwrap(),
            None,
            &fs::metadata(&root).unwrap(),
        );
        assert_eq!(
            indexer.index_content(&dir).await.unwrap(),
            IndexOutcome::Skipped(SkipReason::Directory)
        );

        let synthetic = TreeNode::synthetic(FlatKey::parse("/").unwrap(), None);
        assert_eq!(
            indexer.index_content(&synthetic).await.unwrap(),
            IndexOutcome::Skipped(SkipReason::Synthetic)
        );
        assert_eq!(indexer.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_large_and_empty_files_are_skipped() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let vectors = VectorStore::open(&store.path().join("vectors"), "files")
            .await
            .unwrap();
        let indexer =
            ContentIndexer::new(Arc::new(HashEmbedder::default()), Arc::new(vectors), 8, 1);

        let large = file_node(&files, "big.txt", b"this file is over eight bytes");
        assert_eq!(
            indexer.index_content(&large).await.unwrap(),
            IndexOutcome::Skipped(SkipReason::TooLarge)
        );

        let empty = file_node(&files, "empty.txt", b"  \n ");
        assert_eq!(
            indexer.index_content(&empty).await.unwrap(),
            IndexOutcome::Skipped(SkipReason::EmptyText)
        );
    }

    #[tokio::test]
    async fn test_index_image_file() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let indexer = indexer(&store, HashEmbedder::default()).await;

        let png = crate::extract::encode_png(&RgbImage::from_pixel(
            16,
            16,
            image::Rgb([200, 80, 10]),
        ))
        .unwrap();
        let node = file_node(&files, "sunset.png", &png);
        assert_eq!(
            indexer.index_content(&node).await.unwrap(),
            IndexOutcome::Indexed(Modality::Image)
        );
        assert_eq!(indexer.vectors.count(Modality::Image).await.unwrap(), 1);
        assert_eq!(indexer.vectors.count(Modality::Text).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_per_file_error() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let indexer = indexer(&store, HashEmbedder::default()).await;

        let node = file_node(&files, "broken.png", b"not really a png");
        let err = indexer.index_content(&node).await.unwrap_err();
        assert!(matches!(err, IndexError::ImageDecode { .. }));
    }

    #[tokio::test]
    async fn test_index_many_collects_failures() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let indexer = indexer(&store, HashEmbedder::failing_on("poison")).await;

        let nodes = vec![
            file_node(&files, "a.txt", b"alpha beta"),
            file_node(&files, "b.txt", b"gamma delta"),
            file_node(&files, "c.txt", b"poison pill"),
            file_node(&files, "d.bin", b"\x00"),
            file_node(&files, "e.png", b"garbage"),
        ];
        let progress = IndexProgress::default();
        let summary = indexer.index_many(nodes, &progress).await;

        assert_eq!(summary.indexed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary.failures[0].path.as_str().ends_with("c.txt"));
        assert!(summary.failures[1].path.as_str().ends_with("e.png"));

        let seen = progress.snapshot();
        assert_eq!(seen.queued, 5);
        assert_eq!(seen.indexed, 2);
        assert_eq!(seen.failed, 2);
        assert_eq!(indexer.vectors.count(Modality::Text).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_panicking_extractor_fails_only_that_file() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let mut indexer = indexer(&store, HashEmbedder::default()).await;
        indexer.extract = |node: &TreeNode, max: u64| {
            if node.display_name == "malformed.pdf" {
                panic!("unexpected end of stream");
            }
            prepare(node, max)
        };

        let nodes = vec![
            file_node(&files, "a.txt", b"alpha beta"),
            file_node(&files, "malformed.pdf", b"%PDF-1.4 truncated"),
            file_node(&files, "b.txt", b"gamma delta"),
        ];
        let progress = IndexProgress::default();
        let summary = indexer.index_many(nodes, &progress).await;

        assert_eq!(summary.indexed, 2);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].path.as_str().ends_with("malformed.pdf"));
        assert!(summary.failures[0].error.contains("unexpected end of stream"));
        assert_eq!(progress.snapshot().failed, 1);
        assert_eq!(indexer.vectors.count(Modality::Text).await.unwrap(), 2);

        let single = file_node(&files, "malformed.pdf", b"%PDF-1.4 truncated");
        let err = indexer.index_content(&single).await.unwrap_err();
        assert!(matches!(err, IndexError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_index_many_spans_several_batches() {
        let files = tempdir().unwrap();
        let store = tempdir().unwrap();
        let indexer = indexer(&store, HashEmbedder::default()).await;

        let total = FILE_BATCH * 2 + 3;
        let nodes: Vec<TreeNode> = (0..total)
            .map(|i| file_node(&files, &format!("note{i}.txt"), format!("note number {i}").as_bytes()))
            .collect();
        let progress = IndexProgress::default();
        let summary = indexer.index_many(nodes, &progress).await;

        assert_eq!(summary.indexed, total);
        assert!(summary.failures.is_empty());
        assert_eq!(progress.snapshot().indexed, total);
        assert_eq!(indexer.embedder.calls.load(Ordering::SeqCst), total);
        assert_eq!(indexer.vectors.count(Modality::Text).await.unwrap(), total);
    }
}
