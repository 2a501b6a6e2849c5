//! In-memory tree store.
//!
//! Readers take an `Arc` of the current [`TreeGraph`], which is never mutated
//! in place. Writers clone it, apply patches to the clone, validate, and swap
//! the result in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::types::{
    FlatKey, GraphError, NodeId, SnapshotMetadata, TreeNode, TreeSnapshot, sibling_order,
};

/// Incremental change to the tree.
#[derive(Debug, Clone)]
pub enum Patch {
    /// Insert new nodes; parents must exist in the tree or in the same batch.
    Added(Vec<TreeNode>),
    /// Remove a node and its whole subtree.
    Removed(NodeId),
    /// Rename a node in place; descendants follow.
    Renamed { id: NodeId, new_name: String },
    /// Replace a subtree: `nodes[0]` takes the place of the existing node with
    /// the same id, the old descendants are dropped, the rest are inserted.
    Replaced(Vec<TreeNode>),
}

/// Immutable forest with path lookup.
#[derive(Debug, Clone, Default)]
pub struct TreeGraph {
    nodes: BTreeMap<NodeId, TreeNode>,
    children: BTreeMap<NodeId, Vec<NodeId>>,
    roots: Vec<NodeId>,
    by_path: HashMap<FlatKey, NodeId>,
}

impl TreeGraph {
    /// Build from a snapshot, rejecting it if any invariant fails.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Result<Self, GraphError> {
        snapshot.check_invariants()?;
        let by_path = snapshot
            .nodes
            .values()
            .map(|n| (n.absolute_path.clone(), n.id))
            .collect();
        Ok(Self {
            nodes: snapshot.nodes,
            children: snapshot.adjacency_list,
            roots: snapshot.root_ids,
            by_path,
        })
    }

    pub fn to_snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            nodes: self.nodes.clone(),
            adjacency_list: self.children.clone(),
            root_ids: self.roots.clone(),
            metadata: self.metadata(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata::tally(self.nodes.values())
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn resolve(&self, path: &FlatKey) -> Option<&TreeNode> {
        self.by_path.get(path).and_then(|id| self.nodes.get(id))
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn child_ids(&self, id: NodeId) -> &[NodeId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Children in canonical order; empty for leaves and unknown ids.
    pub fn children(&self, id: NodeId) -> Vec<TreeNode> {
        self.child_ids(id)
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .cloned()
            .collect()
    }

    /// All nodes below `id`, pre-order, not including `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.child_ids(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get(&next) {
                out.push(node);
            }
            stack.extend(self.child_ids(next).iter().rev().copied());
        }
        out
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values()
    }

    pub fn check_invariants(&self) -> Result<(), GraphError> {
        self.to_snapshot().check_invariants()
    }

    /// Apply one patch in place.
    pub fn apply(&mut self, patch: Patch) -> Result<(), GraphError> {
        match patch {
            Patch::Added(nodes) => self.add(nodes),
            Patch::Removed(id) => self.remove(id),
            Patch::Renamed { id, new_name } => self.rename(id, &new_name),
            Patch::Replaced(nodes) => self.replace(nodes),
        }
    }

    fn add(&mut self, nodes: Vec<TreeNode>) -> Result<(), GraphError> {
        let mut batch = HashSet::new();
        for node in &nodes {
            if self.nodes.contains_key(&node.id)
                || self.by_path.contains_key(&node.absolute_path)
                || !batch.insert(node.id)
            {
                return Err(GraphError::DuplicatePath(node.absolute_path.clone()));
            }
        }

        let mut touched = Vec::new();
        for node in nodes {
            if let Some(parent) = node.parent_id {
                self.children.entry(parent).or_default().push(node.id);
                touched.push(parent);
            } else {
                self.roots.push(node.id);
            }
            self.by_path.insert(node.absolute_path.clone(), node.id);
            self.nodes.insert(node.id, node);
        }

        for parent in touched {
            match self.nodes.get(&parent) {
                Some(p) if p.is_directory => self.sort_children(parent),
                Some(_) => return Err(GraphError::ParentNotDirectory(parent)),
                None => return Err(GraphError::DanglingParent(parent)),
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))?;
        let parent = node.parent_id;

        let doomed: Vec<NodeId> = std::iter::once(id)
            .chain(self.descendants(id).into_iter().map(|n| n.id))
            .collect();
        for gone in &doomed {
            if let Some(node) = self.nodes.remove(gone) {
                self.by_path.remove(&node.absolute_path);
            }
            self.children.remove(gone);
        }

        match parent {
            Some(parent) => self.detach_child(parent, id),
            None => self.roots.retain(|r| *r != id),
        }
        Ok(())
    }

    fn rename(&mut self, id: NodeId, new_name: &str) -> Result<(), GraphError> {
        let node = self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))?;
        let old_key = node.absolute_path.clone();
        let new_key = old_key
            .with_file_name(new_name)
            .map_err(|_| GraphError::IdMismatch(old_key.clone()))?;
        if new_key == old_key {
            return Ok(());
        }
        if self.by_path.contains_key(&new_key) {
            return Err(GraphError::DuplicatePath(new_key));
        }

        let subtree: Vec<NodeId> = std::iter::once(id)
            .chain(self.descendants(id).into_iter().map(|n| n.id))
            .collect();

        // Old id to new id for every node in the subtree.
        let mut remap: HashMap<NodeId, NodeId> = HashMap::with_capacity(subtree.len());
        let mut moved = Vec::with_capacity(subtree.len());
        for old_id in &subtree {
            let Some(old) = self.nodes.remove(old_id) else {
                continue;
            };
            self.by_path.remove(&old.absolute_path);
            let key = old
                .absolute_path
                .rebase(&old_key, &new_key)
                .ok_or_else(|| GraphError::IdMismatch(old.absolute_path.clone()))?;
            let parent = match old.parent_id {
                Some(p) => Some(remap.get(&p).copied().unwrap_or(p)),
                None => None,
            };
            let renamed = old.moved_to(key, parent);
            remap.insert(*old_id, renamed.id);
            moved.push(renamed);
        }

        for node in moved {
            self.by_path.insert(node.absolute_path.clone(), node.id);
            self.nodes.insert(node.id, node);
        }

        for old_id in &subtree {
            if let Some(kids) = self.children.remove(old_id) {
                let kids = kids.iter().map(|k| remap.get(k).copied().unwrap_or(*k)).collect();
                self.children.insert(remap[old_id], kids);
            }
        }

        let new_id = remap[&id];
        let parent = self.nodes.get(&new_id).and_then(|n| n.parent_id);
        match parent {
            Some(parent) => {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    for sibling in siblings.iter_mut() {
                        if *sibling == id {
                            *sibling = new_id;
                        }
                    }
                }
                self.sort_children(parent);
            }
            None => {
                for root in self.roots.iter_mut() {
                    if *root == id {
                        *root = new_id;
                    }
                }
            }
        }

        debug!(from = %old_key, to = %new_key, nodes = subtree.len(), "renamed subtree");
        Ok(())
    }

    fn replace(&mut self, nodes: Vec<TreeNode>) -> Result<(), GraphError> {
        let mut nodes = nodes.into_iter();
        let Some(head) = nodes.next() else {
            return Ok(());
        };
        let existing = self
            .nodes
            .get(&head.id)
            .ok_or(GraphError::UnknownNode(head.id))?;
        if existing.parent_id != head.parent_id || existing.absolute_path != head.absolute_path {
            return Err(GraphError::AdjacencyMismatch(head.id));
        }

        for child in self.child_ids(head.id).to_vec() {
            self.remove(child)?;
        }
        self.nodes.insert(head.id, head);
        self.add(nodes.collect())
    }

    fn detach_child(&mut self, parent: NodeId, child: NodeId) {
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|c| *c != child);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }
    }

    fn sort_children(&mut self, parent: NodeId) {
        let nodes = &self.nodes;
        if let Some(kids) = self.children.get_mut(&parent) {
            kids.sort_by(|a, b| match (nodes.get(a), nodes.get(b)) {
                (Some(a), Some(b)) => sibling_order(a, b),
                _ => a.cmp(b),
            });
        }
    }
}

/// Holder of the current graph.
#[derive(Debug, Default)]
pub struct TreeStore {
    current: RwLock<Arc<TreeGraph>>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tree with a validated snapshot.
    pub fn load(&self, snapshot: TreeSnapshot) -> Result<(), GraphError> {
        let graph = TreeGraph::from_snapshot(snapshot)?;
        self.replace(graph);
        Ok(())
    }

    pub fn replace(&self, graph: TreeGraph) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(graph);
    }

    pub fn current(&self) -> Arc<TreeGraph> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.current().to_snapshot()
    }

    pub fn children(&self, id: NodeId) -> Vec<TreeNode> {
        self.current().children(id)
    }

    pub fn resolve(&self, path: &FlatKey) -> Option<TreeNode> {
        self.current().resolve(path).cloned()
    }

    /// Apply patches to a copy of the current graph and publish it.
    ///
    /// On error nothing is published.
    pub fn apply(&self, patches: Vec<Patch>) -> Result<Arc<TreeGraph>, GraphError> {
        let mut next = (*self.current()).clone();
        for patch in patches {
            next.apply(patch)?;
        }
        next.check_invariants()?;
        let next = Arc::new(next);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> FlatKey {
        FlatKey::parse(path).unwrap()
    }

    fn dir(path: &str) -> TreeNode {
        let key = key(path);
        let parent = key.parent().map(|p| NodeId::for_key(&p));
        let mut node = TreeNode::synthetic(key, parent);
        node.is_synthetic = false;
        node
    }

    fn file(path: &str) -> TreeNode {
        let mut node = dir(path);
        node.is_directory = false;
        node.extension = crate::types::extension_of(&node.display_name);
        node.size_bytes = Some(10);
        node
    }

    fn root(path: &str) -> TreeNode {
        let mut node = dir(path);
        node.parent_id = None;
        node
    }

    fn sample() -> TreeStore {
        let nodes = vec![
            root("/|r"),
            dir("/|r|docs"),
            file("/|r|docs|a.txt"),
            dir("/|r|docs|sub"),
            file("/|r|docs|sub|b.txt"),
            file("/|r|top.txt"),
        ];
        let r = nodes[0].id;
        let store = TreeStore::new();
        store.load(TreeSnapshot::assemble(nodes, vec![r])).unwrap();
        store
    }

    fn child_names(store: &TreeStore, path: &str) -> Vec<String> {
        let node = store.resolve(&key(path)).unwrap();
        store
            .children(node.id)
            .into_iter()
            .map(|n| n.display_name)
            .collect()
    }

    #[test]
    fn test_load_rejects_invalid_snapshot() {
        let store = TreeStore::new();
        let mut snapshot = sample().snapshot();
        snapshot.root_ids.push(snapshot.root_ids[0]);
        assert!(store.load(snapshot).is_err());
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = sample();
        let snapshot = store.snapshot();
        let reloaded = TreeStore::new();
        reloaded.load(snapshot.clone()).unwrap();
        assert_eq!(reloaded.snapshot(), snapshot);
    }

    #[test]
    fn test_children_and_resolve() {
        let store = sample();
        assert_eq!(child_names(&store, "/|r"), ["docs", "top.txt"]);
        assert_eq!(child_names(&store, "/|r|docs"), ["sub", "a.txt"]);
        assert!(child_names(&store, "/|r|top.txt").is_empty());
        assert!(store.resolve(&key("/|r|nope")).is_none());
        assert!(store.children(NodeId::for_key(&key("/|nowhere"))).is_empty());
    }

    #[test]
    fn test_add_sorts_only_affected_parent() {
        let store = sample();
        store
            .apply(vec![Patch::Added(vec![dir("/|r|alpha"), file("/|r|alpha|z.txt")])])
            .unwrap();
        assert_eq!(child_names(&store, "/|r"), ["alpha", "docs", "top.txt"]);
        assert_eq!(child_names(&store, "/|r|alpha"), ["z.txt"]);
        assert_eq!(store.current().metadata().total_nodes, 8);
    }

    #[test]
    fn test_add_rejects_duplicates_and_dangling_parents() {
        let store = sample();
        let before = store.snapshot();
        assert!(matches!(
            store.apply(vec![Patch::Added(vec![file("/|r|top.txt")])]),
            Err(GraphError::DuplicatePath(_))
        ));
        assert!(matches!(
            store.apply(vec![Patch::Added(vec![file("/|r|ghost|x.txt")])]),
            Err(GraphError::DanglingParent(_))
        ));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_remove_cascades() {
        let store = sample();
        let docs = store.resolve(&key("/|r|docs")).unwrap();
        store.apply(vec![Patch::Removed(docs.id)]).unwrap();

        for gone in ["/|r|docs", "/|r|docs|a.txt", "/|r|docs|sub", "/|r|docs|sub|b.txt"] {
            assert!(store.resolve(&key(gone)).is_none(), "{gone} still present");
        }
        assert_eq!(child_names(&store, "/|r"), ["top.txt"]);
        assert_eq!(store.current().len(), 2);
    }

    #[test]
    fn test_remove_last_child_drops_adjacency_entry() {
        let store = sample();
        let top = store.resolve(&key("/|r|top.txt")).unwrap();
        let docs = store.resolve(&key("/|r|docs")).unwrap();
        store
            .apply(vec![Patch::Removed(top.id), Patch::Removed(docs.id)])
            .unwrap();
        let snapshot = store.snapshot();
        assert!(snapshot.adjacency_list.is_empty());
        snapshot.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_root() {
        let store = sample();
        let r = store.resolve(&key("/|r")).unwrap();
        store.apply(vec![Patch::Removed(r.id)]).unwrap();
        assert!(store.current().is_empty());
        assert!(store.snapshot().root_ids.is_empty());
    }

    #[test]
    fn test_rename_cascades_paths_and_ids() {
        let store = sample();
        let docs = store.resolve(&key("/|r|docs")).unwrap();
        let old_ids: Vec<NodeId> = store
            .current()
            .descendants(docs.id)
            .iter()
            .map(|n| n.id)
            .collect();

        store
            .apply(vec![Patch::Renamed {
                id: docs.id,
                new_name: "papers".to_string(),
            }])
            .unwrap();

        assert!(store.resolve(&key("/|r|docs")).is_none());
        let papers = store.resolve(&key("/|r|papers")).unwrap();
        assert_eq!(papers.id, NodeId::for_key(&key("/|r|papers")));
        let b = store.resolve(&key("/|r|papers|sub|b.txt")).unwrap();
        assert_eq!(b.id, NodeId::for_key(&b.absolute_path));
        let sub = store.resolve(&key("/|r|papers|sub")).unwrap();
        assert_eq!(b.parent_id, Some(sub.id));
        assert_eq!(sub.parent_id, Some(papers.id));

        let graph = store.current();
        for old in old_ids {
            assert!(graph.node(old).is_none());
        }
        assert_eq!(child_names(&store, "/|r"), ["papers", "top.txt"]);
        assert_eq!(child_names(&store, "/|r|papers"), ["sub", "a.txt"]);
        graph.check_invariants().unwrap();
    }

    #[test]
    fn test_rename_reorders_siblings_and_updates_extension() {
        let store = sample();
        let top = store.resolve(&key("/|r|top.txt")).unwrap();
        store
            .apply(vec![Patch::Added(vec![file("/|r|m.txt")])])
            .unwrap();
        store
            .apply(vec![Patch::Renamed {
                id: top.id,
                new_name: "a.md".to_string(),
            }])
            .unwrap();
        assert_eq!(child_names(&store, "/|r"), ["docs", "a.md", "m.txt"]);
        assert_eq!(store.resolve(&key("/|r|a.md")).unwrap().extension, "md");
    }

    #[test]
    fn test_rename_root_keeps_position() {
        let store = sample();
        store
            .apply(vec![Patch::Added(vec![root("/|other")])])
            .unwrap();
        let r = store.resolve(&key("/|r")).unwrap();
        store
            .apply(vec![Patch::Renamed {
                id: r.id,
                new_name: "zz".to_string(),
            }])
            .unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.root_ids[0], NodeId::for_key(&key("/|zz")));
        assert_eq!(snapshot.root_ids[1], NodeId::for_key(&key("/|other")));
        assert!(store.resolve(&key("/|zz|docs|sub|b.txt")).is_some());
    }

    #[test]
    fn test_rename_onto_existing_sibling_fails() {
        let store = sample();
        let before = store.snapshot();
        let top = store.resolve(&key("/|r|top.txt")).unwrap();
        assert!(matches!(
            store.apply(vec![Patch::Renamed {
                id: top.id,
                new_name: "docs".to_string()
            }]),
            Err(GraphError::DuplicatePath(_))
        ));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_replace_subtree_keeps_position() {
        let store = sample();
        let docs = store.resolve(&key("/|r|docs")).unwrap();
        let mut fresh_docs = docs.clone();
        fresh_docs.modified_at = Some(chrono::Utc::now());
        store
            .apply(vec![Patch::Replaced(vec![
                fresh_docs.clone(),
                file("/|r|docs|new.txt"),
            ])])
            .unwrap();

        assert_eq!(child_names(&store, "/|r"), ["docs", "top.txt"]);
        assert_eq!(child_names(&store, "/|r|docs"), ["new.txt"]);
        assert_eq!(store.resolve(&key("/|r|docs")).unwrap(), fresh_docs);
        assert!(store.resolve(&key("/|r|docs|sub|b.txt")).is_none());
    }

    /// Small deterministic generator so the structural test is reproducible.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((self.0 >> 33) as usize) % bound.max(1)
        }
    }

    #[test]
    fn test_invariants_hold_under_random_patches() {
        for seed in 0..16u64 {
            let mut rng = Lcg(seed);
            let store = TreeStore::new();
            store
                .apply(vec![Patch::Added(vec![root("/|r")])])
                .unwrap();

            for step in 0..60 {
                let graph = store.current();
                let all: Vec<TreeNode> = graph.nodes().cloned().collect();
                let dirs: Vec<&TreeNode> = all.iter().filter(|n| n.is_directory).collect();
                let patch = match rng.next(4) {
                    0 | 1 if !dirs.is_empty() => {
                        let parent = dirs[rng.next(dirs.len())];
                        let name = format!("n{step}_{}", rng.next(1000));
                        let path = parent.absolute_path.join(&name).unwrap();
                        if rng.next(2) == 0 {
                            dir(path.as_str())
                        } else {
                            file(&format!("{}.txt", path.as_str()))
                        }
                    }
                    2 if all.len() > 1 => {
                        let victim = &all[rng.next(all.len())];
                        if victim.parent_id.is_none() {
                            continue;
                        }
                        store.apply(vec![Patch::Removed(victim.id)]).unwrap();
                        continue;
                    }
                    _ if all.len() > 1 => {
                        let target = &all[rng.next(all.len())];
                        let new_name = format!("R{step}");
                        store
                            .apply(vec![Patch::Renamed {
                                id: target.id,
                                new_name,
                            }])
                            .unwrap();
                        continue;
                    }
                    _ => continue,
                };
                store.apply(vec![Patch::Added(vec![patch])]).unwrap();

                let snapshot = store.snapshot();
                snapshot.check_invariants().unwrap();
                let reloaded = TreeStore::new();
                reloaded.load(snapshot.clone()).unwrap();
                assert_eq!(reloaded.snapshot(), snapshot, "seed {seed} step {step}");
            }
            store.snapshot().check_invariants().unwrap();
        }
    }
}
