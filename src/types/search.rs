use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::node::TreeNode;
use super::path::FlatKey;

/// Embedding space a record or query lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Text, Modality::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            other => Err(format!("unknown modality: {other}")),
        }
    }
}

/// One search hit mapped back onto the tree.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: FlatKey,
    pub score: f32,
    #[serde(rename = "type")]
    pub modality: Modality,
    /// Matching node, absent when the path no longer resolves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<TreeNode>,
    /// The index still holds this path but the tree does not.
    pub unresolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub modality: Modality,
    pub results: Vec<SearchResult>,
    pub total_results: usize,
}
