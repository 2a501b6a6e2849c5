use std::path::PathBuf;

use thiserror::Error;

/// Per-file content indexing failure.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file too large: {path} ({size} bytes)")]
    TooLarge { path: PathBuf, size: u64 },

    #[error("failed to extract text from {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error("failed to decode image {path}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },

    #[error("embeddings error: {0:#}")]
    Embeddings(#[from] anyhow::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl IndexError {
    pub(crate) fn extraction(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::Extraction {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
