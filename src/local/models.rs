//! Data models for local storage.

use serde::{Deserialize, Serialize};

use crate::types::{FlatKey, Modality, NodeId};

// ============================================================================
// Vector Models
// ============================================================================

/// Descriptive fields stored next to each vector.
///
/// Nothing here depends on when indexing ran, so re-indexing an unchanged
/// file yields an identical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub name: String,
    pub extension: String,
    /// SHA-256 hex of the raw file bytes.
    pub content_hash: String,
    pub snippet: String,
    pub chunks: u32,
    pub modified_at: Option<String>,
}

/// One file's entry in the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub path: FlatKey,
    pub modality: Modality,
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl IndexRecord {
    /// Key used in store predicates; derived from the path so it is always
    /// plain ASCII.
    pub fn key(&self) -> String {
        record_key(&self.path)
    }

    /// Same record under a new path.
    pub fn moved_to(&self, path: FlatKey) -> Self {
        Self {
            metadata: RecordMetadata {
                name: path.file_name(),
                ..self.metadata.clone()
            },
            path,
            ..self.clone()
        }
    }
}

pub fn record_key(path: &FlatKey) -> String {
    NodeId::for_key(path).to_string()
}

/// A search hit from vector similarity search.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub path: String,
    /// L2 distance (lower = more similar)
    pub distance: f32,
}

impl VectorHit {
    /// Convert distance to similarity score (0-1, higher = more similar).
    pub fn score(&self) -> f32 {
        1.0 / (1.0 + self.distance)
    }
}

/// Stored path plus the modification time it was indexed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub path: String,
    pub modality: Modality,
    pub modified_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_is_monotonic_in_distance() {
        let near = VectorHit {
            path: "a".into(),
            distance: 0.0,
        };
        let far = VectorHit {
            path: "b".into(),
            distance: 3.0,
        };
        assert_eq!(near.score(), 1.0);
        assert_eq!(far.score(), 0.25);
    }

    #[test]
    fn test_record_key_is_ascii() {
        let key = record_key(&FlatKey::parse("/|ünï|q3\\|x.txt").unwrap());
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }
}
