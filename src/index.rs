//! Reverse invalidation index.
//!
//! Maps each node identity read during validation to the cache nodes
//! that read it, so a set of externally reported changed identities can
//! be turned into a precise set of cache nodes to mark dirty. The index
//! is maintained incrementally alongside validation: when a cache node
//! recomputes, its old entries are replaced; when it is destroyed, they
//! are removed. After a completed pass the index holds exactly the reads
//! of the current tree.

use crate::cache::CacheNodeId;
use crate::model::NodeRef;

/// Multimap from read node identity to reading cache nodes.
#[derive(Default)]
pub(crate) struct ReverseIndex {
    map: ahash::HashMap<NodeRef, ahash::HashSet<CacheNodeId>>,
}

impl ReverseIndex {
    /// Register the identities a cache node read.
    pub fn record(&mut self, reader: CacheNodeId, reads: &[NodeRef]) {
        for read in reads {
            self.map.entry(*read).or_default().insert(reader);
        }
    }

    /// Drop a cache node's entries for the given identities.
    pub fn forget(&mut self, reader: CacheNodeId, reads: &[NodeRef]) {
        for read in reads {
            if let Some(readers) = self.map.get_mut(read) {
                readers.remove(&reader);
                if readers.is_empty() {
                    self.map.remove(read);
                }
            }
        }
    }

    /// The cache nodes that read `node`.
    pub fn lookup(&self, node: NodeRef) -> Vec<CacheNodeId> {
        self.map
            .get(&node)
            .map(|readers| readers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `node` was read by anything.
    pub fn contains(&self, node: NodeRef) -> bool {
        self.map.contains_key(&node)
    }

    /// Every indexed identity.
    pub fn tracked(&self) -> Vec<NodeRef> {
        self.map.keys().copied().collect()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
