//! LanceDB vector storage for similarity search.
//!
//! One table per modality (`<base>-text`, `<base>-image`), one row per file.
//! The vector width is taken from the first batch written to a table.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, Table};
use tracing::debug;

use super::models::{IndexRecord, RecordMetadata, StoredEntry, VectorHit, record_key};
use crate::types::{FlatKey, Modality};

/// Keys per `IN (...)` predicate.
const PREDICATE_BATCH: usize = 256;

/// LanceDB-based vector store.
pub struct VectorStore {
    db: Connection,
    table_base: String,
}

impl VectorStore {
    /// Open or create a vector store at the given path.
    pub async fn open(path: &Path, table_base: &str) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let uri = path
            .to_str()
            .with_context(|| format!("Vector store path is not UTF-8: {}", path.display()))?;
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            db,
            table_base: sanitize_table_name(table_base),
        })
    }

    pub fn table_name(&self, modality: Modality) -> String {
        format!("{}-{}", self.table_base, modality.as_str())
    }

    async fn open_table(&self, modality: Modality) -> Result<Option<Table>> {
        let name = self.table_name(modality);
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .context("Failed to list tables")?;
        if !names.contains(&name) {
            return Ok(None);
        }

        let table = self
            .db
            .open_table(&name)
            .execute()
            .await
            .with_context(|| format!("Failed to open table '{name}'"))?;
        Ok(Some(table))
    }

    /// Insert or replace records, keyed by path.
    ///
    /// A record for the same path in the other modality's table is removed.
    pub async fn upsert(&self, records: Vec<IndexRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = records.iter().map(IndexRecord::key).collect();
        self.delete_keys(&keys).await?;

        let mut by_modality: BTreeMap<Modality, Vec<IndexRecord>> = BTreeMap::new();
        for record in records {
            by_modality.entry(record.modality).or_default().push(record);
        }

        for (modality, records) in by_modality {
            let dim = vector_dim(&records)?;
            let batch = records_to_batch(&records, dim)?;
            let schema = batch.schema();
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

            match self.open_table(modality).await? {
                Some(table) => {
                    let existing = table_dim(&table).await?;
                    if existing != dim {
                        bail!(
                            "Vector width {dim} does not match table '{}' ({existing})",
                            self.table_name(modality)
                        );
                    }
                    table
                        .add(Box::new(batches))
                        .execute()
                        .await
                        .context("Failed to insert vectors")?;
                }
                None => {
                    let name = self.table_name(modality);
                    self.db
                        .create_table(&name, Box::new(batches))
                        .execute()
                        .await
                        .with_context(|| format!("Failed to create table '{name}'"))?;
                }
            }
            debug!(modality = %modality, count = records.len(), "upserted records");
        }

        Ok(())
    }

    /// Remove the records of the given paths from every table.
    pub async fn delete_paths(&self, paths: &[FlatKey]) -> Result<()> {
        let keys: Vec<String> = paths.iter().map(record_key).collect();
        self.delete_keys(&keys).await
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for modality in Modality::ALL {
            let Some(table) = self.open_table(modality).await? else {
                continue;
            };
            for chunk in keys.chunks(PREDICATE_BATCH) {
                table
                    .delete(&key_predicate(chunk))
                    .await
                    .context("Failed to delete vectors")?;
            }
        }
        Ok(())
    }

    /// Rewrite the path of existing records; vectors are kept as they are.
    ///
    /// Returns the number of records moved.
    pub async fn move_paths(&self, moves: &[(FlatKey, FlatKey)]) -> Result<usize> {
        if moves.is_empty() {
            return Ok(0);
        }

        let targets: BTreeMap<String, &FlatKey> =
            moves.iter().map(|(from, to)| (record_key(from), to)).collect();
        let keys: Vec<String> = targets.keys().cloned().collect();

        let mut moved = Vec::new();
        for modality in Modality::ALL {
            for record in self.records_by_key(modality, &keys).await? {
                if let Some(to) = targets.get(&record.key()) {
                    moved.push(record.moved_to((*to).clone()));
                }
            }
        }

        let count = moved.len();
        self.delete_keys(&keys).await?;
        self.upsert(moved).await?;
        Ok(count)
    }

    /// Full records for the given paths in one modality.
    pub async fn records(&self, modality: Modality, paths: &[FlatKey]) -> Result<Vec<IndexRecord>> {
        let keys: Vec<String> = paths.iter().map(record_key).collect();
        self.records_by_key(modality, &keys).await
    }

    async fn records_by_key(&self, modality: Modality, keys: &[String]) -> Result<Vec<IndexRecord>> {
        let Some(table) = self.open_table(modality).await? else {
            return Ok(vec![]);
        };

        let mut records = Vec::new();
        for chunk in keys.chunks(PREDICATE_BATCH) {
            let batches = table
                .query()
                .only_if(key_predicate(chunk))
                .execute()
                .await
                .context("Failed to query vectors")?
                .try_collect::<Vec<_>>()
                .await
                .context("Failed to collect records")?;
            for batch in &batches {
                records.extend(batch_to_records(batch, modality)?);
            }
        }
        Ok(records)
    }

    /// Search for similar vectors in one modality's table.
    pub async fn search(
        &self,
        modality: Modality,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let Some(table) = self.open_table(modality).await? else {
            return Ok(vec![]);
        };

        let results = table
            .query()
            .nearest_to(query_vector)
            .context("Invalid query vector")?
            .limit(limit)
            .execute()
            .await
            .context("Failed to execute search")?
            .try_collect::<Vec<_>>()
            .await
            .context("Failed to collect results")?;

        let mut hits = Vec::new();
        for batch in results {
            hits.extend(batch_to_hits(&batch)?);
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);

        Ok(hits)
    }

    /// Every stored path of one modality with its indexed modification time.
    pub async fn entries(&self, modality: Modality) -> Result<Vec<StoredEntry>> {
        let Some(table) = self.open_table(modality).await? else {
            return Ok(vec![]);
        };
        let total = table.count_rows(None).await.context("Failed to count rows")?;
        if total == 0 {
            return Ok(vec![]);
        }

        let batches = table
            .query()
            .limit(total)
            .execute()
            .await
            .context("Failed to scan table")?
            .try_collect::<Vec<_>>()
            .await
            .context("Failed to collect rows")?;

        let mut entries = Vec::with_capacity(total);
        for batch in &batches {
            let paths = string_column(batch, "file_path")?;
            let modified = string_column(batch, "modified_at")?;
            for i in 0..batch.num_rows() {
                entries.push(StoredEntry {
                    path: paths.value(i).to_string(),
                    modality,
                    modified_at: (!modified.is_null(i)).then(|| modified.value(i).to_string()),
                });
            }
        }
        Ok(entries)
    }

    pub async fn count(&self, modality: Modality) -> Result<usize> {
        match self.open_table(modality).await? {
            Some(table) => table.count_rows(None).await.context("Failed to count rows"),
            None => Ok(0),
        }
    }

    /// Drop both modality tables.
    pub async fn clear(&self) -> Result<()> {
        for modality in Modality::ALL {
            if self.open_table(modality).await?.is_some() {
                let name = self.table_name(modality);
                self.db
                    .drop_table(&name)
                    .await
                    .with_context(|| format!("Failed to drop table '{name}'"))?;
            }
        }
        Ok(())
    }
}

fn schema(dim: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("record_key", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("extension", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("snippet", DataType::Utf8, false),
        Field::new("chunks", DataType::UInt32, false),
        Field::new("modified_at", DataType::Utf8, true),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim),
            false,
        ),
    ]))
}

fn vector_dim(records: &[IndexRecord]) -> Result<i32> {
    let dim = records.first().map(|r| r.vector.len()).unwrap_or_default();
    if dim == 0 {
        bail!("Cannot store empty vectors");
    }
    if let Some(bad) = records.iter().find(|r| r.vector.len() != dim) {
        bail!(
            "Vector for {} has width {}, expected {dim}",
            bad.path,
            bad.vector.len()
        );
    }
    i32::try_from(dim).context("Vector width out of range")
}

async fn table_dim(table: &Table) -> Result<i32> {
    let schema = table.schema().await.context("Failed to read table schema")?;
    match schema.field_with_name("vector")?.data_type() {
        DataType::FixedSizeList(_, dim) => Ok(*dim),
        other => bail!("Unexpected vector column type: {other}"),
    }
}

fn records_to_batch(records: &[IndexRecord], dim: i32) -> Result<RecordBatch> {
    let keys: Vec<String> = records.iter().map(IndexRecord::key).collect();
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    let names: Vec<&str> = records.iter().map(|r| r.metadata.name.as_str()).collect();
    let extensions: Vec<&str> = records
        .iter()
        .map(|r| r.metadata.extension.as_str())
        .collect();
    let hashes: Vec<&str> = records
        .iter()
        .map(|r| r.metadata.content_hash.as_str())
        .collect();
    let snippets: Vec<&str> = records.iter().map(|r| r.metadata.snippet.as_str()).collect();
    let chunks: Vec<u32> = records.iter().map(|r| r.metadata.chunks).collect();
    let modified: Vec<Option<&str>> = records
        .iter()
        .map(|r| r.metadata.modified_at.as_deref())
        .collect();
    let flat_vectors: Vec<f32> = records
        .iter()
        .flat_map(|r| r.vector.iter().copied())
        .collect();

    let vector_array = FixedSizeListArray::new(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dim,
        Arc::new(Float32Array::from(flat_vectors)),
        None,
    );

    RecordBatch::try_new(
        schema(dim),
        vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(StringArray::from(paths)),
            Arc::new(StringArray::from(names)),
            Arc::new(StringArray::from(extensions)),
            Arc::new(StringArray::from(hashes)),
            Arc::new(StringArray::from(snippets)),
            Arc::new(UInt32Array::from(chunks)),
            Arc::new(StringArray::from(modified)),
            Arc::new(vector_array),
        ],
    )
    .context("Failed to create record batch")
}

fn batch_to_records(batch: &RecordBatch, modality: Modality) -> Result<Vec<IndexRecord>> {
    let paths = string_column(batch, "file_path")?;
    let names = string_column(batch, "name")?;
    let extensions = string_column(batch, "extension")?;
    let hashes = string_column(batch, "content_hash")?;
    let snippets = string_column(batch, "snippet")?;
    let modified = string_column(batch, "modified_at")?;
    let chunks = batch
        .column_by_name("chunks")
        .context("Missing chunks column")?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .context("Invalid chunks type")?;
    let vectors = batch
        .column_by_name("vector")
        .context("Missing vector column")?
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .context("Invalid vector type")?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let values = vectors.value(i);
        let values = values
            .as_any()
            .downcast_ref::<Float32Array>()
            .context("Invalid vector item type")?;
        records.push(IndexRecord {
            path: FlatKey::parse(paths.value(i))
                .with_context(|| format!("Corrupt path in vector store: {}", paths.value(i)))?,
            modality,
            vector: values.values().to_vec(),
            metadata: RecordMetadata {
                name: names.value(i).to_string(),
                extension: extensions.value(i).to_string(),
                content_hash: hashes.value(i).to_string(),
                snippet: snippets.value(i).to_string(),
                chunks: chunks.value(i),
                modified_at: (!modified.is_null(i)).then(|| modified.value(i).to_string()),
            },
        });
    }
    Ok(records)
}

fn batch_to_hits(batch: &RecordBatch) -> Result<Vec<VectorHit>> {
    let paths = string_column(batch, "file_path")?;

    let distances = batch
        .column_by_name("_distance")
        .context("Missing _distance column")?
        .as_any()
        .downcast_ref::<Float32Array>()
        .context("Invalid _distance type")?;

    let mut hits = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        hits.push(VectorHit {
            path: paths.value(i).to_string(),
            distance: distances.value(i),
        });
    }

    Ok(hits)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Missing {name} column"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("Invalid {name} type"))
}

/// `record_key IN (...)`; keys are hyphenated UUIDs so no quoting issues arise.
fn key_predicate(keys: &[String]) -> String {
    let list = keys
        .iter()
        .map(|k| format!("'{}'", k.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ");
    format!("record_key IN ({list})")
}

fn sanitize_table_name(name: &str) -> String {
    // LanceDB: "Table names can only contain alphanumeric characters, underscores, hyphens, and periods"
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(path: &str, modality: Modality, vector: Vec<f32>) -> IndexRecord {
        let path = FlatKey::parse(path).unwrap();
        IndexRecord {
            metadata: RecordMetadata {
                name: path.file_name(),
                extension: "txt".to_string(),
                content_hash: "hash".to_string(),
                snippet: String::new(),
                chunks: 1,
                modified_at: Some("2024-01-01T00:00:00.000000000Z".to_string()),
            },
            path,
            modality,
            vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_search() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "files").await.unwrap();

        store
            .upsert(vec![
                record("/|r|a.txt", Modality::Text, vec![1.0, 0.0, 0.0]),
                record("/|r|b.txt", Modality::Text, vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .search(Modality::Text, &[1.0, 0.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "/|r|a.txt");
        assert!(hits[0].score() > hits[1].score());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_path() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "files").await.unwrap();

        store
            .upsert(vec![record("/|r|a.txt", Modality::Text, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert(vec![record("/|r|a.txt", Modality::Text, vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.count(Modality::Text).await.unwrap(), 1);
        let stored = store
            .records(Modality::Text, &[FlatKey::parse("/|r|a.txt").unwrap()])
            .await
            .unwrap();
        assert_eq!(stored[0].vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_modalities_use_separate_tables() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "files").await.unwrap();

        store
            .upsert(vec![
                record("/|r|a.txt", Modality::Text, vec![1.0, 0.0]),
                record("/|r|p.png", Modality::Image, vec![1.0, 0.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let text = store.search(Modality::Text, &[1.0, 0.0], 10).await.unwrap();
        let image = store
            .search(Modality::Image, &[1.0, 0.0, 0.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].path, "/|r|a.txt");
        assert_eq!(image.len(), 1);
        assert_eq!(image[0].path, "/|r|p.png");
    }

    #[tokio::test]
    async fn test_delete_and_move_paths() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "files").await.unwrap();

        store
            .upsert(vec![
                record("/|r|d|a.txt", Modality::Text, vec![1.0, 0.0]),
                record("/|r|d|b.txt", Modality::Text, vec![0.0, 1.0]),
                record("/|r|c.txt", Modality::Text, vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        store
            .delete_paths(&[FlatKey::parse("/|r|c.txt").unwrap()])
            .await
            .unwrap();
        assert_eq!(store.count(Modality::Text).await.unwrap(), 2);

        let moves = vec![
            (
                FlatKey::parse("/|r|d|a.txt").unwrap(),
                FlatKey::parse("/|r|e|a.txt").unwrap(),
            ),
            (
                FlatKey::parse("/|r|d|b.txt").unwrap(),
                FlatKey::parse("/|r|e|b.txt").unwrap(),
            ),
        ];
        assert_eq!(store.move_paths(&moves).await.unwrap(), 2);

        let mut paths: Vec<String> = store
            .entries(Modality::Text)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        paths.sort();
        assert_eq!(paths, ["/|r|e|a.txt", "/|r|e|b.txt"]);
    }

    #[tokio::test]
    async fn test_width_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "files").await.unwrap();

        store
            .upsert(vec![record("/|r|a.txt", Modality::Text, vec![1.0, 0.0])])
            .await
            .unwrap();
        let err = store
            .upsert(vec![record("/|r|b.txt", Modality::Text, vec![1.0, 0.0, 0.0])])
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_clear_drops_tables() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path(), "my files").await.unwrap();
        assert_eq!(store.table_name(Modality::Text), "my_files-text");

        store
            .upsert(vec![record("/|r|a.txt", Modality::Text, vec![1.0])])
            .await
            .unwrap();
        store.clear().await.unwrap();

        assert_eq!(store.count(Modality::Text).await.unwrap(), 0);
        assert!(store.search(Modality::Text, &[1.0], 5).await.unwrap().is_empty());
    }
}
