use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::Metadata;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::path::FlatKey;

/// Namespace for node ids derived from flat keys.
const NODE_NAMESPACE: Uuid = Uuid::from_u128(0x3b1f_9c52_7a0e_4d8b_a6c1_58e2_0f94_d713);

/// Stable node identifier: a UUIDv5 of the node's flat key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn for_key(key: &FlatKey) -> Self {
        Self(Uuid::new_v5(&NODE_NAMESPACE, key.as_str().as_bytes()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One file-system entry (or synthesized placeholder directory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    pub absolute_path: FlatKey,
    pub parent_id: Option<NodeId>,
    pub display_name: String,
    pub is_directory: bool,
    pub extension: String,
    pub size_bytes: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub is_synthetic: bool,
}

impl TreeNode {
    /// Build a node for a real entry from its metadata.
    pub fn from_metadata(key: FlatKey, parent_id: Option<NodeId>, metadata: &Metadata) -> Self {
        let is_directory = metadata.is_dir();
        let display_name = key.file_name();
        Self {
            id: NodeId::for_key(&key),
            extension: if is_directory {
                String::new()
            } else {
                extension_of(&display_name)
            },
            absolute_path: key,
            parent_id,
            display_name,
            is_directory,
            size_bytes: (!is_directory).then(|| metadata.len()),
            created_at: metadata.created().ok().map(DateTime::<Utc>::from),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            is_synthetic: false,
        }
    }

    /// Placeholder directory for an ancestor above an indexed root.
    pub fn synthetic(key: FlatKey, parent_id: Option<NodeId>) -> Self {
        Self {
            id: NodeId::for_key(&key),
            display_name: key.file_name(),
            absolute_path: key,
            parent_id,
            is_directory: true,
            extension: String::new(),
            size_bytes: None,
            created_at: None,
            modified_at: None,
            is_synthetic: true,
        }
    }

    /// Real file whose content can be indexed.
    pub fn is_content_file(&self) -> bool {
        !self.is_directory && !self.is_synthetic
    }

    /// Same entry under a different path, keeping metadata.
    pub fn moved_to(&self, key: FlatKey, parent_id: Option<NodeId>) -> Self {
        let display_name = key.file_name();
        Self {
            id: NodeId::for_key(&key),
            extension: if self.is_directory {
                String::new()
            } else {
                extension_of(&display_name)
            },
            absolute_path: key,
            parent_id,
            display_name,
            ..self.clone()
        }
    }
}

/// Lower-cased extension without the dot; empty for dotfiles and names without one.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

/// Render a timestamp the way it is stored alongside index records.
pub fn timestamp_key(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Canonical sibling order: directories first, then case-insensitive name,
/// then exact name.
pub fn sibling_order(a: &TreeNode, b: &TreeNode) -> Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
        })
        .then_with(|| a.display_name.cmp(&b.display_name))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub total_nodes: usize,
    pub total_files: usize,
    pub total_directories: usize,
    pub synthetic_directories: usize,
}

impl SnapshotMetadata {
    pub fn tally<'a>(nodes: impl IntoIterator<Item = &'a TreeNode>) -> Self {
        let mut metadata = Self::default();
        for node in nodes {
            metadata.total_nodes += 1;
            if node.is_directory {
                metadata.total_directories += 1;
                if node.is_synthetic {
                    metadata.synthetic_directories += 1;
                }
            } else {
                metadata.total_files += 1;
            }
        }
        metadata
    }
}

/// Serializable, self-contained view of the whole tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub nodes: BTreeMap<NodeId, TreeNode>,
    pub adjacency_list: BTreeMap<NodeId, Vec<NodeId>>,
    pub root_ids: Vec<NodeId>,
    pub metadata: SnapshotMetadata,
}

impl TreeSnapshot {
    /// Build a snapshot from nodes, deriving child lists in canonical order.
    pub fn assemble(nodes: Vec<TreeNode>, root_ids: Vec<NodeId>) -> Self {
        let nodes: BTreeMap<NodeId, TreeNode> =
            nodes.into_iter().map(|node| (node.id, node)).collect();

        let mut adjacency_list: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for node in nodes.values() {
            if let Some(parent) = node.parent_id {
                adjacency_list.entry(parent).or_default().push(node.id);
            }
        }
        for children in adjacency_list.values_mut() {
            children.sort_by(|a, b| sibling_order(&nodes[a], &nodes[b]));
        }

        let metadata = SnapshotMetadata::tally(nodes.values());
        Self {
            nodes,
            adjacency_list,
            root_ids,
            metadata,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check every structural invariant of the forest.
    pub fn check_invariants(&self) -> Result<(), GraphError> {
        let mut paths = HashSet::new();
        for (id, node) in &self.nodes {
            if *id != node.id {
                return Err(GraphError::KeyMismatch(*id));
            }
            if NodeId::for_key(&node.absolute_path) != node.id {
                return Err(GraphError::IdMismatch(node.absolute_path.clone()));
            }
            if !paths.insert(&node.absolute_path) {
                return Err(GraphError::DuplicatePath(node.absolute_path.clone()));
            }
            if node.is_synthetic && !node.is_directory {
                return Err(GraphError::SyntheticFile(node.id));
            }
            if let Some(parent) = node.parent_id {
                match self.nodes.get(&parent) {
                    Some(parent_node) if parent_node.is_directory => {}
                    Some(_) => return Err(GraphError::ParentNotDirectory(node.id)),
                    None => return Err(GraphError::DanglingParent(node.id)),
                }
            }
        }

        let mut listed = HashSet::new();
        for (parent, children) in &self.adjacency_list {
            if children.is_empty() {
                return Err(GraphError::EmptyChildList(*parent));
            }
            for child in children {
                let node = self
                    .nodes
                    .get(child)
                    .ok_or(GraphError::UnknownNode(*child))?;
                if node.parent_id != Some(*parent) {
                    return Err(GraphError::AdjacencyMismatch(*child));
                }
                if !listed.insert(*child) {
                    return Err(GraphError::DuplicateChild(*child));
                }
            }
        }
        let non_roots = self.nodes.values().filter(|n| n.parent_id.is_some()).count();
        if listed.len() != non_roots {
            let missing = self
                .nodes
                .values()
                .find(|n| n.parent_id.is_some() && !listed.contains(&n.id))
                .map(|n| n.id);
            return Err(missing.map_or(GraphError::Cycle, GraphError::AdjacencyMismatch));
        }

        let mut roots = HashSet::new();
        for root in &self.root_ids {
            let node = self.nodes.get(root).ok_or(GraphError::UnknownNode(*root))?;
            if node.parent_id.is_some() || !roots.insert(*root) {
                return Err(GraphError::BadRoot(*root));
            }
        }
        if roots.len() != self.nodes.len() - non_roots {
            return Err(GraphError::MissingRoot);
        }

        // Every node must be reachable from a root; otherwise a parent cycle exists.
        let mut reached = 0usize;
        let mut stack: Vec<NodeId> = self.root_ids.clone();
        while let Some(id) = stack.pop() {
            reached += 1;
            if let Some(children) = self.adjacency_list.get(&id) {
                stack.extend(children.iter().copied());
            }
        }
        if reached != self.nodes.len() {
            return Err(GraphError::Cycle);
        }

        if self.metadata != SnapshotMetadata::tally(self.nodes.values()) {
            return Err(GraphError::MetadataMismatch);
        }
        Ok(())
    }
}

/// Structural problems in a snapshot or a patch against it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node stored under foreign key {0}")]
    KeyMismatch(NodeId),

    #[error("node id does not match its path: {0}")]
    IdMismatch(FlatKey),

    #[error("duplicate path: {0}")]
    DuplicatePath(FlatKey),

    #[error("synthetic node {0} is not a directory")]
    SyntheticFile(NodeId),

    #[error("parent of {0} is missing")]
    DanglingParent(NodeId),

    #[error("parent of {0} is not a directory")]
    ParentNotDirectory(NodeId),

    #[error("empty child list for {0}")]
    EmptyChildList(NodeId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("child list disagrees with parent of {0}")]
    AdjacencyMismatch(NodeId),

    #[error("node {0} listed twice")]
    DuplicateChild(NodeId),

    #[error("invalid root {0}")]
    BadRoot(NodeId),

    #[error("parentless node missing from root list")]
    MissingRoot,

    #[error("parent links form a cycle")]
    Cycle,

    #[error("metadata counts do not match nodes")]
    MetadataMismatch,
}
