// Nested reactive records
//
// A ReactiveTree stores nested records in a slab owned by the tree itself, so
// there is no process-wide "is this reactive" registry. Each nested node keeps
// a non-owning link to its parent (parent id + the key it lives under). A
// mutation walks that chain upward and marks the linking key dirty on every
// ancestor, ending at the root, whose dirty keys are what a flat
// StateContainer needs to know about.
//
// The parent chain is acyclic by construction: nodes are only created through
// insert_child, which always links a fresh node below an existing one.

use serde_json::Value;
use slab::Slab;

use crate::hash::FastIndexMap;
use crate::state::{ChangeSet, Record, StateContainer};

/// Identifier for a node in a [`ReactiveTree`].
///
/// Ids are only meaningful for the tree that issued them. After a node is
/// removed its id is stale and every lookup through it returns `None`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct ParentLink {
    node: NodeId,
    key: String,
}

#[derive(Debug, Default)]
struct Node {
    fields: Record,
    children: FastIndexMap<String, NodeId>,
    parent: Option<ParentLink>,
    changed: ChangeSet,
}

/// Arena of nested records with upward change propagation.
#[derive(Debug)]
pub struct ReactiveTree {
    nodes: Slab<Node>,
    root: NodeId,
}

impl Default for ReactiveTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactiveTree {
    /// Create a tree with an empty root record.
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        let root = NodeId(nodes.insert(Node::default()) as u32);
        Self { nodes, root }
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Whether `node` is still part of this tree.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(node.index())
    }

    /// Read a scalar field.
    pub fn get(&self, node: NodeId, key: &str) -> Option<&Value> {
        self.nodes.get(node.index())?.fields.get(key)
    }

    /// Look up a nested record.
    pub fn child(&self, node: NodeId, key: &str) -> Option<NodeId> {
        self.nodes.get(node.index())?.children.get(key).copied()
    }

    /// The parent of `node` and the key `node` lives under.
    pub fn parent(&self, node: NodeId) -> Option<(NodeId, &str)> {
        let link = self.nodes.get(node.index())?.parent.as_ref()?;
        Some((link.node, link.key.as_str()))
    }

    /// Set a scalar field, returning `true` if the value changed.
    ///
    /// A nested record previously stored under `key` is removed.
    pub fn set(&mut self, node: NodeId, key: &str, value: Value) -> bool {
        let Some(entry) = self.nodes.get(node.index()) else {
            return false;
        };
        if entry.fields.get(key) == Some(&value) {
            return false;
        }
        if let Some(child) = entry.children.get(key).copied() {
            self.remove_subtree(child);
        }

        if let Some(entry) = self.nodes.get_mut(node.index()) {
            entry.children.shift_remove(key);
            entry.fields.insert(key.to_string(), value);
        }
        self.mark_changed(node, key);
        true
    }

    /// Create an empty nested record under `key`, replacing whatever was there.
    pub fn insert_child(&mut self, parent: NodeId, key: &str) -> Option<NodeId> {
        let previous = {
            let entry = self.nodes.get_mut(parent.index())?;
            entry.fields.shift_remove(key);
            entry.children.get(key).copied()
        };
        if let Some(previous) = previous {
            self.remove_subtree(previous);
        }

        let child = NodeId(self.nodes.insert(Node {
            parent: Some(ParentLink {
                node: parent,
                key: key.to_string(),
            }),
            ..Node::default()
        }) as u32);
        if let Some(entry) = self.nodes.get_mut(parent.index()) {
            entry.children.insert(key.to_string(), child);
        }
        self.mark_changed(parent, key);
        Some(child)
    }

    /// Remove a nested record and everything below it.
    ///
    /// The root cannot be removed.
    pub fn remove(&mut self, node: NodeId) -> bool {
        if node == self.root || !self.contains(node) {
            return false;
        }
        let link = self.nodes[node.index()]
            .parent
            .as_ref()
            .map(|link| (link.node, link.key.clone()));

        self.remove_subtree(node);
        if let Some((parent, key)) = link {
            if let Some(entry) = self.nodes.get_mut(parent.index()) {
                entry.children.shift_remove(&key);
            }
            self.mark_changed(parent, &key);
        }
        true
    }

    /// Whether `node` has unacknowledged changes.
    pub fn is_dirty(&self, node: NodeId) -> bool {
        self.nodes
            .get(node.index())
            .is_some_and(|entry| !entry.changed.is_empty())
    }

    /// Drain the root's changed keys and clear every node's markers.
    pub fn take_changes(&mut self) -> ChangeSet {
        let changed = std::mem::take(&mut self.nodes[self.root.index()].changed);
        for (_, node) in self.nodes.iter_mut() {
            node.changed.clear();
        }
        changed
    }

    /// Materialize a node (recursively) as a JSON object.
    pub fn to_value(&self, node: NodeId) -> Value {
        let Some(entry) = self.nodes.get(node.index()) else {
            return Value::Null;
        };
        let mut map = serde_json::Map::new();
        for (key, value) in &entry.fields {
            map.insert(key.clone(), value.clone());
        }
        for (key, child) in &entry.children {
            map.insert(key.clone(), self.to_value(*child));
        }
        Value::Object(map)
    }

    /// Patch the root-level keys that changed since the last commit into
    /// `container`, removing keys that no longer exist.
    pub fn commit_into(&mut self, container: &StateContainer) {
        let changed = self.take_changes();
        let mut removed = Vec::new();
        let mut patch = Vec::new();
        for key in changed {
            if let Some(value) = self.get(self.root, &key) {
                patch.push((key, value.clone()));
            } else if let Some(child) = self.child(self.root, &key) {
                patch.push((key, self.to_value(child)));
            } else {
                removed.push(key);
            }
        }
        container.patch(patch);
        container.remove(removed);
    }

    // Walk the parent chain, marking the linking key on every ancestor.
    fn mark_changed(&mut self, node: NodeId, key: &str) {
        let mut current = Some((node, key.to_string()));
        while let Some((id, key)) = current.take() {
            let Some(entry) = self.nodes.get_mut(id.index()) else {
                break;
            };
            // An already-marked key means the chain above is marked too.
            if !entry.changed.insert(key) {
                break;
            }
            current = entry
                .parent
                .as_ref()
                .map(|link| (link.node, link.key.clone()));
        }
    }

    fn remove_subtree(&mut self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(entry) = self.nodes.try_remove(id.index()) {
                stack.extend(entry.children.values().copied());
            }
        }
    }
}
