//! Node identity, the narrow model-access interface, and change intake.
//!
//! The model tree itself lives outside this crate. Everything here is the
//! contract the core consumes: opaque node identities, role/concept
//! tokens, read-only node access, and a buffer for externally reported
//! changes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ModelReadError;

/// Opaque identity of a node in the external model.
///
/// The token is owned by the model; this crate only compares, hashes and
/// stores it. The inner value carries no meaning here.
///
/// # Examples
///
/// ```
/// # use treeql::NodeRef;
/// let a = NodeRef::new(7);
/// assert_eq!(a, NodeRef::new(7));
/// assert_ne!(a, NodeRef::new(8));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(u64);

impl NodeRef {
    /// Wrap a raw model-assigned identity.
    pub const fn new(raw: u64) -> Self {
        NodeRef(raw)
    }

    /// The raw identity, for adapters that need to map back to the model.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A child, reference, or property role token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoleId(Arc<str>);

impl RoleId {
    /// Create a role token.
    pub fn new(name: impl AsRef<str>) -> Self {
        RoleId(Arc::from(name.as_ref()))
    }

    /// The role name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoleId {
    fn from(name: &str) -> Self {
        RoleId::new(name)
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A concept (node type) token, conventionally a dot-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConceptId(Arc<str>);

impl ConceptId {
    /// Create a concept token.
    pub fn new(name: impl AsRef<str>) -> Self {
        ConceptId(Arc::from(name.as_ref()))
    }

    /// The full token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final dot-separated segment of the token.
    pub fn short_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl From<&str> for ConceptId {
    fn from(name: &str) -> Self {
        ConceptId::new(name)
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only access to the external model tree.
///
/// All methods may fail with a not-found condition; the evaluator maps
/// those to empty results instead of propagating them. Implementations
/// should reserve [`ModelReadError::Backend`] for real store failures.
pub trait ModelReader {
    /// All children of `node` across all roles.
    fn all_children(&self, node: NodeRef) -> Result<Vec<NodeRef>, ModelReadError>;

    /// Children of `node` in `role`, in model order.
    fn children(&self, node: NodeRef, role: &RoleId) -> Result<Vec<NodeRef>, ModelReadError>;

    /// The containing parent, if any.
    fn parent(&self, node: NodeRef) -> Result<Option<NodeRef>, ModelReadError>;

    /// The target of the reference in `role`, if populated and resolvable.
    fn reference_target(
        &self,
        node: NodeRef,
        role: &RoleId,
    ) -> Result<Option<NodeRef>, ModelReadError>;

    /// All populated reference roles on `node`.
    fn reference_roles(&self, node: NodeRef) -> Result<Vec<RoleId>, ModelReadError>;

    /// The property value in `role`, if set.
    fn property(&self, node: NodeRef, role: &RoleId) -> Result<Option<String>, ModelReadError>;

    /// The concept of `node`, if known.
    fn concept(&self, node: NodeRef) -> Result<Option<ConceptId>, ModelReadError>;

    /// Resolve a serialized identity against the resolution scope of
    /// `scope`.
    fn resolve_id(
        &self,
        scope: NodeRef,
        serialized: &str,
    ) -> Result<Option<NodeRef>, ModelReadError>;
}

impl<M: ModelReader + ?Sized> ModelReader for &M {
    fn all_children(&self, node: NodeRef) -> Result<Vec<NodeRef>, ModelReadError> {
        (**self).all_children(node)
    }

    fn children(&self, node: NodeRef, role: &RoleId) -> Result<Vec<NodeRef>, ModelReadError> {
        (**self).children(node, role)
    }

    fn parent(&self, node: NodeRef) -> Result<Option<NodeRef>, ModelReadError> {
        (**self).parent(node)
    }

    fn reference_target(
        &self,
        node: NodeRef,
        role: &RoleId,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        (**self).reference_target(node, role)
    }

    fn reference_roles(&self, node: NodeRef) -> Result<Vec<RoleId>, ModelReadError> {
        (**self).reference_roles(node)
    }

    fn property(&self, node: NodeRef, role: &RoleId) -> Result<Option<String>, ModelReadError> {
        (**self).property(node, role)
    }

    fn concept(&self, node: NodeRef) -> Result<Option<ConceptId>, ModelReadError> {
        (**self).concept(node)
    }

    fn resolve_id(
        &self,
        scope: NodeRef,
        serialized: &str,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        (**self).resolve_id(scope, serialized)
    }
}

impl<M: ModelReader + ?Sized> ModelReader for Arc<M> {
    fn all_children(&self, node: NodeRef) -> Result<Vec<NodeRef>, ModelReadError> {
        (**self).all_children(node)
    }

    fn children(&self, node: NodeRef, role: &RoleId) -> Result<Vec<NodeRef>, ModelReadError> {
        (**self).children(node, role)
    }

    fn parent(&self, node: NodeRef) -> Result<Option<NodeRef>, ModelReadError> {
        (**self).parent(node)
    }

    fn reference_target(
        &self,
        node: NodeRef,
        role: &RoleId,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        (**self).reference_target(node, role)
    }

    fn reference_roles(&self, node: NodeRef) -> Result<Vec<RoleId>, ModelReadError> {
        (**self).reference_roles(node)
    }

    fn property(&self, node: NodeRef, role: &RoleId) -> Result<Option<String>, ModelReadError> {
        (**self).property(node, role)
    }

    fn concept(&self, node: NodeRef) -> Result<Option<ConceptId>, ModelReadError> {
        (**self).concept(node)
    }

    fn resolve_id(
        &self,
        scope: NodeRef,
        serialized: &str,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        (**self).resolve_id(scope, serialized)
    }
}

/// Collects change notifications until the owner of a
/// [`QueryEngine`](crate::QueryEngine) is ready to apply them.
///
/// The model may report changes from any thread; the engine consumes them
/// single-threaded. Changes are node-granular: any kind of change to a
/// node (property, reference, child set, containment) is reported as the
/// node itself.
///
/// This is cheap to clone; clones share the same buffer.
///
/// # Examples
///
/// ```
/// # use treeql::{ChangeBuffer, NodeRef};
/// let buffer = ChangeBuffer::new();
/// buffer.notify(NodeRef::new(3));
/// buffer.notify(NodeRef::new(3));
/// assert_eq!(buffer.drain().len(), 1);
/// assert!(buffer.drain().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChangeBuffer {
    changed: Arc<Mutex<ahash::HashSet<NodeRef>>>,
}

impl ChangeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a changed node.
    pub fn notify(&self, node: NodeRef) {
        self.changed.lock().insert(node);
    }

    /// Record a batch of changed nodes.
    pub fn notify_all(&self, nodes: impl IntoIterator<Item = NodeRef>) {
        let mut changed = self.changed.lock();
        changed.extend(nodes);
    }

    /// Take every change recorded so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<NodeRef> {
        self.changed.lock().drain().collect()
    }

    /// Whether anything has been recorded since the last drain.
    pub fn is_empty(&self) -> bool {
        self.changed.lock().is_empty()
    }
}
