//! An in-memory model tree.
//!
//! `MemoryModel` is a complete [`ModelReader`] backed by shared state:
//! clones read and mutate the same tree, so a test (or a small embedded
//! host) can hand one clone to a [`QueryEngine`](crate::QueryEngine) and
//! keep editing through another. Every mutation reports the affected
//! node identities into the model's [`ChangeBuffer`], ready to be drained
//! into `invalidate`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ModelReadError;
use crate::model::{ChangeBuffer, ConceptId, ModelReader, NodeRef, RoleId};

#[derive(Default)]
struct NodeData {
    parent: Option<NodeRef>,
    children: Vec<(RoleId, NodeRef)>,
    properties: Vec<(RoleId, String)>,
    references: Vec<(RoleId, NodeRef)>,
    concept: Option<ConceptId>,
    serialized: Option<String>,
}

#[derive(Default)]
struct ModelInner {
    nodes: ahash::HashMap<NodeRef, NodeData>,
    ids: ahash::HashMap<String, NodeRef>,
    next: u64,
}

impl ModelInner {
    fn node(&self, node: NodeRef) -> Result<&NodeData, ModelReadError> {
        self.nodes.get(&node).ok_or(ModelReadError::UnknownNode(node))
    }
}

/// A shared, mutable in-memory model tree.
///
/// # Examples
///
/// ```
/// # use treeql::{MemoryModel, ModelReader};
/// let model = MemoryModel::new();
/// let root = model.add_root("fs.Root");
/// let child = model.add_child(root, "items", "fs.File");
/// assert_eq!(model.all_children(root).unwrap(), vec![child]);
/// assert_eq!(model.parent(child).unwrap(), Some(root));
/// ```
#[derive(Clone, Default)]
pub struct MemoryModel {
    inner: Arc<Mutex<ModelInner>>,
    changes: ChangeBuffer,
}

impl MemoryModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer receiving change notifications from mutators.
    pub fn changes(&self) -> ChangeBuffer {
        self.changes.clone()
    }

    fn allocate(inner: &mut ModelInner, concept: &str) -> NodeRef {
        let node = NodeRef::new(inner.next);
        inner.next += 1;
        inner.nodes.insert(
            node,
            NodeData {
                concept: Some(ConceptId::new(concept)),
                ..NodeData::default()
            },
        );
        node
    }

    /// Add a parentless node.
    pub fn add_root(&self, concept: &str) -> NodeRef {
        let inner = &mut *self.inner.lock();
        Self::allocate(inner, concept)
    }

    /// Add a child under `parent` in `role`, appended in role order.
    pub fn add_child(&self, parent: NodeRef, role: impl Into<RoleId>, concept: &str) -> NodeRef {
        let inner = &mut *self.inner.lock();
        let node = Self::allocate(inner, concept);
        if let Some(data) = inner.nodes.get_mut(&node) {
            data.parent = Some(parent);
        }
        if let Some(data) = inner.nodes.get_mut(&parent) {
            data.children.push((role.into(), node));
        }
        self.changes.notify(parent);
        node
    }

    /// Set a property value.
    pub fn set_property(&self, node: NodeRef, role: impl Into<RoleId>, value: impl Into<String>) {
        let role = role.into();
        let value = value.into();
        let mut inner = self.inner.lock();
        if let Some(data) = inner.nodes.get_mut(&node) {
            if let Some(slot) = data.properties.iter_mut().find(|(r, _)| *r == role) {
                slot.1 = value;
            } else {
                data.properties.push((role, value));
            }
            self.changes.notify(node);
        }
    }

    /// Set (or retarget) a reference.
    pub fn set_reference(&self, node: NodeRef, role: impl Into<RoleId>, target: NodeRef) {
        let role = role.into();
        let mut inner = self.inner.lock();
        if let Some(data) = inner.nodes.get_mut(&node) {
            if let Some(slot) = data.references.iter_mut().find(|(r, _)| *r == role) {
                slot.1 = target;
            } else {
                data.references.push((role, target));
            }
            self.changes.notify(node);
        }
    }

    /// Change a node's concept.
    pub fn set_concept(&self, node: NodeRef, concept: &str) {
        let mut inner = self.inner.lock();
        if let Some(data) = inner.nodes.get_mut(&node) {
            data.concept = Some(ConceptId::new(concept));
            self.changes.notify(node);
        }
    }

    /// Register a serialized identity for by-id resolution.
    pub fn set_serialized_id(&self, node: NodeRef, id: impl Into<String>) {
        let id = id.into();
        let inner = &mut *self.inner.lock();
        if let Some(data) = inner.nodes.get_mut(&node) {
            if let Some(previous) = data.serialized.replace(id.clone()) {
                inner.ids.remove(&previous);
            }
            inner.ids.insert(id, node);
            self.changes.notify(node);
        }
    }

    /// Remove a node and its subtree.
    pub fn remove_node(&self, node: NodeRef) {
        let inner = &mut *self.inner.lock();
        let parent = inner.nodes.get(&node).and_then(|data| data.parent);
        if let Some(parent) = parent {
            if let Some(data) = inner.nodes.get_mut(&parent) {
                data.children.retain(|(_, child)| *child != node);
            }
        }
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if let Some(data) = inner.nodes.remove(&current) {
                if let Some(id) = data.serialized {
                    inner.ids.remove(&id);
                }
                stack.extend(data.children.iter().map(|(_, child)| *child));
                self.changes.notify(current);
            }
        }
        if let Some(parent) = parent {
            self.changes.notify(parent);
        }
    }
}

impl ModelReader for MemoryModel {
    fn all_children(&self, node: NodeRef) -> Result<Vec<NodeRef>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner.node(node)?.children.iter().map(|(_, c)| *c).collect())
    }

    fn children(&self, node: NodeRef, role: &RoleId) -> Result<Vec<NodeRef>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner
            .node(node)?
            .children
            .iter()
            .filter(|(r, _)| r == role)
            .map(|(_, c)| *c)
            .collect())
    }

    fn parent(&self, node: NodeRef) -> Result<Option<NodeRef>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner.node(node)?.parent)
    }

    fn reference_target(
        &self,
        node: NodeRef,
        role: &RoleId,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner
            .node(node)?
            .references
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, target)| *target))
    }

    fn reference_roles(&self, node: NodeRef) -> Result<Vec<RoleId>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner.node(node)?.references.iter().map(|(r, _)| r.clone()).collect())
    }

    fn property(&self, node: NodeRef, role: &RoleId) -> Result<Option<String>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner
            .node(node)?
            .properties
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, value)| value.clone()))
    }

    fn concept(&self, node: NodeRef) -> Result<Option<ConceptId>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner.node(node)?.concept.clone())
    }

    fn resolve_id(
        &self,
        _scope: NodeRef,
        serialized: &str,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        let inner = self.inner.lock();
        Ok(inner.ids.get(serialized).copied())
    }
}
