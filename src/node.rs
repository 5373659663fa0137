//! The shared path tree (spec.md §4.1).
//!
//! Nodes live in an arena (`Vec<Option<NodeSlot>>`) addressed by a stable
//! [`NodeId`] rather than through `Rc`/`Weak` cycles — per spec.md §9's
//! design note, this sidesteps the reference-counting cycle the original C
//! `node_t::parent` pointer plus the user-data back-pointer would otherwise
//! create in a naive port.

use std::collections::HashMap;
use std::path::{Path, MAIN_SEPARATOR, MAIN_SEPARATOR_STR};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::fdata::FDataId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

const ROOT: NodeId = NodeId(0);

struct NodeSlot {
    filename: String,
    basename: String,
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    user_data: Option<FDataId>,
}

struct PendingRemoval {
    filename: String,
    requested_at: Instant,
}

/// A shared directory tree keyed by absolute path.
pub struct NodeTree {
    slots: Vec<Option<NodeSlot>>,
    free: Vec<u32>,
    pending: Vec<PendingRemoval>,
}

impl NodeTree {
    pub fn new() -> Self {
        let root = NodeSlot {
            filename: MAIN_SEPARATOR_STR.to_string(),
            basename: MAIN_SEPARATOR_STR.to_string(),
            parent: None,
            children: HashMap::new(),
            user_data: None,
        };
        Self {
            slots: vec![Some(root)],
            free: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    fn slot(&self, id: NodeId) -> &NodeSlot {
        self.slots[id.0 as usize].as_ref().expect("dangling NodeId")
    }

    fn slot_mut(&mut self, id: NodeId) -> &mut NodeSlot {
        self.slots[id.0 as usize].as_mut().expect("dangling NodeId")
    }

    pub fn filename(&self, id: NodeId) -> &str {
        &self.slot(id).filename
    }

    pub fn basename(&self, id: NodeId) -> &str {
        &self.slot(id).basename
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slot(id).parent
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        id == ROOT
    }

    pub fn children_len(&self, id: NodeId) -> usize {
        self.slot(id).children.len()
    }

    pub fn children_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.slot(id).children.values().copied().collect()
    }

    pub fn data(&self, id: NodeId) -> Option<FDataId> {
        self.slot(id).user_data
    }

    pub fn set_data(&mut self, id: NodeId, data: Option<FDataId>) -> Option<FDataId> {
        std::mem::replace(&mut self.slot_mut(id).user_data, data)
    }

    pub fn child(&self, parent: NodeId, basename: &str) -> Option<NodeId> {
        self.slot(parent).children.get(basename).copied()
    }

    fn alloc(&mut self, filename: String, basename: String, parent: NodeId) -> NodeId {
        let slot = NodeSlot {
            filename,
            basename,
            parent: Some(parent),
            children: HashMap::new(),
            user_data: None,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            NodeId(idx)
        } else {
            self.slots.push(Some(slot));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    fn join(parent_filename: &str, basename: &str) -> String {
        if parent_filename == MAIN_SEPARATOR_STR {
            format!("{MAIN_SEPARATOR}{basename}")
        } else {
            format!("{parent_filename}{MAIN_SEPARATOR}{basename}")
        }
    }

    /// Creates (or reuses) a single child node under `parent`.
    fn add_child(&mut self, parent: NodeId, basename: &str) -> NodeId {
        if let Some(existing) = self.child(parent, basename) {
            return existing;
        }
        let filename = Self::join(&self.slot(parent).filename, basename);
        let child = self.alloc(filename, basename.to_string(), parent);
        self.slot_mut(parent)
            .children
            .insert(basename.to_string(), child);
        trace!(path = %self.filename(child), "node created");
        child
    }

    fn components(path: &str) -> Vec<&str> {
        Path::new(path)
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .filter(|s| *s != MAIN_SEPARATOR_STR)
            .collect()
    }

    /// Descends from root matching path components. Returns the deepest
    /// existing node that is a prefix of `path`, and whether it is an exact
    /// match.
    pub fn find(&self, path: &str) -> (NodeId, bool) {
        let mut node = ROOT;
        let components = Self::components(path);
        for (i, comp) in components.iter().enumerate() {
            match self.child(node, comp) {
                Some(next) => node = next,
                None => return (node, i == components.len()),
            }
        }
        (node, true)
    }

    /// Descends from root; whenever a component has no child, `on_missing`
    /// is consulted to materialize one. Returns `None` if `on_missing`
    /// declines.
    pub fn find_or_create(
        &mut self,
        path: &str,
        mut on_missing: impl FnMut(&mut NodeTree, NodeId, &str) -> Option<NodeId>,
    ) -> Option<NodeId> {
        let mut node = ROOT;
        for comp in Self::components(path) {
            node = match self.child(node, comp) {
                Some(next) => next,
                None => on_missing(self, node, comp)?,
            };
        }
        Some(node)
    }

    /// Creates intermediate nodes as needed under `parent` for the
    /// components of `relative_path` and returns the leaf.
    pub fn insert(&mut self, parent: NodeId, relative_path: &str) -> NodeId {
        let mut node = parent;
        for comp in Self::components(relative_path) {
            node = self.add_child(node, comp);
        }
        node
    }

    /// Depth-first pre-order traversal.
    pub fn traverse(&self, node: NodeId, visitor: &mut impl FnMut(&NodeTree, NodeId)) {
        visitor(self, node);
        for child in self.children_ids(node) {
            self.traverse(child, visitor);
        }
    }

    fn unlink_from_parent(&mut self, node: NodeId) {
        if let Some(parent) = self.slot(node).parent {
            let basename = self.slot(node).basename.clone();
            self.slot_mut(parent).children.remove(&basename);
        }
    }

    fn free_node(&mut self, node: NodeId) {
        debug_assert!(self.slot(node).children.is_empty());
        debug_assert!(self.slot(node).user_data.is_none());
        trace!(path = %self.filename(node), "node freed");
        self.slots[node.0 as usize] = None;
        self.free.push(node.0);
    }

    /// Removes `node` (and propagates upward through now-empty ancestors) if
    /// `pre_delete` allows it. `pre_delete` is consulted *before* the node is
    /// unlinked so it may run arbitrary teardown (e.g. freeing an FData)
    /// without racing a concurrent lookup.
    pub fn remove(
        &mut self,
        node: NodeId,
        pre_delete: &mut impl FnMut(&mut NodeTree, NodeId) -> bool,
    ) -> bool {
        if self.is_root(node) {
            return true;
        }
        if self.children_len(node) > 0 {
            return false;
        }
        if self.data(node).is_some() && !pre_delete(self, node) {
            return false;
        }
        let parent = self.parent(node).expect("non-root always has a parent");
        self.unlink_from_parent(node);
        self.free_node(node);
        if self.children_len(parent) == 0 {
            self.remove(parent, pre_delete);
        }
        true
    }

    /// Records a removal request for later processing by [`Self::sweep_pending`],
    /// collapsing duplicates by exact filename equality (spec.md's Design
    /// Notes flags the original's case-insensitive comparison as a likely
    /// legacy artifact; this port compares case-sensitively).
    pub fn pending_remove(&mut self, node: NodeId) {
        let filename = self.filename(node).to_string();
        if self.pending.iter().any(|p| p.filename == filename) {
            debug!(path = %filename, "pending removal already queued");
            return;
        }
        self.pending.push(PendingRemoval {
            filename,
            requested_at: Instant::now(),
        });
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Runs due pending removals (those older than `cool_off`), resolving
    /// each filename back to a node first since it may have been recreated
    /// or already removed in the interim.
    pub fn sweep_pending(
        &mut self,
        cool_off: Duration,
        pre_delete: &mut impl FnMut(&mut NodeTree, NodeId) -> bool,
    ) {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|p| now.duration_since(p.requested_at) >= cool_off)
            .map(|p| p.filename.clone())
            .collect();
        self.pending.retain(|p| now.duration_since(p.requested_at) < cool_off);
        for filename in due {
            let (node, exact) = self.find(&filename);
            if exact {
                self.remove(node, pre_delete);
            }
        }
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_create_builds_intermediate_nodes() {
        let mut tree = NodeTree::new();
        let leaf = tree
            .find_or_create("/a/b/c", |tree, parent, comp| Some(tree.insert(parent, comp)))
            .unwrap();
        assert_eq!(tree.filename(leaf), "/a/b/c");
        let (found, exact) = tree.find("/a/b/c");
        assert!(exact);
        assert_eq!(found, leaf);
    }

    #[test]
    fn find_returns_deepest_prefix_when_missing() {
        let mut tree = NodeTree::new();
        tree.insert(tree.root(), "a/b");
        let (found, exact) = tree.find("/a/b/c/d");
        assert!(!exact);
        assert_eq!(tree.filename(found), "/a/b");
    }

    #[test]
    fn remove_propagates_to_empty_parent() {
        let mut tree = NodeTree::new();
        let leaf = tree.insert(tree.root(), "a/b");
        let mut pre_delete = |_: &mut NodeTree, _: NodeId| true;
        assert!(tree.remove(leaf, &mut pre_delete));
        let (found, exact) = tree.find("/a/b");
        assert!(!exact);
        assert_eq!(found, tree.root());
        assert_eq!(tree.children_len(tree.root()), 0);
    }

    #[test]
    fn remove_refuses_when_children_remain() {
        let mut tree = NodeTree::new();
        let parent = tree.insert(tree.root(), "a");
        tree.insert(parent, "b");
        let mut pre_delete = |_: &mut NodeTree, _: NodeId| true;
        assert!(!tree.remove(parent, &mut pre_delete));
    }

    #[test]
    fn root_is_never_removed() {
        let mut tree = NodeTree::new();
        let mut pre_delete = |_: &mut NodeTree, _: NodeId| true;
        assert!(tree.remove(tree.root(), &mut pre_delete));
        assert_eq!(tree.filename(tree.root()), "/");
    }

    #[test]
    fn pending_remove_dedupes_by_filename() {
        let mut tree = NodeTree::new();
        let leaf = tree.insert(tree.root(), "a/b");
        tree.pending_remove(leaf);
        tree.pending_remove(leaf);
        assert_eq!(tree.pending.len(), 1);
    }
}
