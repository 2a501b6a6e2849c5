use std::path::PathBuf;

use thiserror::Error;

use super::node::GraphError;
use super::path::PathError;
use crate::extract::IndexError;

/// Errors surfaced by tree operations.
///
/// Precondition failures (`InvalidPath`, `NotIndexed`, `AlreadyExists`,
/// `InvalidQuery`) are always raised before any side effect.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("cannot crawl {root}: {source}")]
    Crawl {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not indexed: {0}")]
    NotIndexed(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("content index error: {0}")]
    Index(#[from] IndexError),

    #[error("{op} failed for {path}: {source}")]
    FileSystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inconsistent tree: {0}")]
    Graph(#[from] GraphError),

    #[error("storage error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl TreeError {
    pub fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            op,
            path: path.into(),
            source,
        }
    }
}

pub type TreeResult<T> = Result<T, TreeError>;
