//! The top-level incremental query engine.

use crate::bulk::BatchFetch;
use crate::cache::CacheTree;
use crate::error::StreamError;
use crate::eval::{ReadExecutor, ReadRequest, ReadResponse};
use crate::index::ReverseIndex;
use crate::model::{ModelReader, NodeRef};
use crate::query::QuerySpec;

/// Caches query results per query-tree node and recomputes only what a
/// reported change actually touched.
///
/// One engine owns one validation tree and must be driven from one place
/// at a time (`&mut self`); callers wanting concurrent queries over the
/// same model keep one engine per logical session.
///
/// # Examples
///
/// ```
/// # use treeql::{Filter, MemoryModel, QueryEngine, QuerySpec, StepKind, Subquery};
/// let model = MemoryModel::new();
/// let root = model.add_root("fs.Root");
/// let docs = model.add_child(root, "items", "fs.Folder");
/// let note = model.add_child(root, "items", "fs.File");
///
/// let spec = QuerySpec::single(
///     Subquery::new(StepKind::Descendants).filtered(Filter::ConceptName("Folder".into())),
/// );
///
/// let mut engine = QueryEngine::direct(model.clone());
/// let mut found = Vec::new();
/// engine.validate(&spec, root, |node| found.push(node)).unwrap();
/// assert_eq!(found, vec![docs]);
///
/// // An edit arrives; only the affected paths are recomputed.
/// model.set_concept(note, "fs.Folder");
/// engine.invalidate(model.changes().drain());
///
/// let mut found = Vec::new();
/// engine.validate(&spec, root, |node| found.push(node)).unwrap();
/// assert_eq!(found, vec![docs, note]);
/// ```
pub struct QueryEngine {
    executor: ReadExecutor,
    tree: CacheTree,
    index: ReverseIndex,
    spec: Option<QuerySpec>,
    root: Option<NodeRef>,
}

impl QueryEngine {
    /// An engine reading a local model directly.
    pub fn direct(model: impl ModelReader + 'static) -> Self {
        Self::with_executor(ReadExecutor::direct(model))
    }

    /// An engine reading through an injected batch fetch function, for
    /// models where every round trip counts.
    pub fn batched(
        fetch: impl BatchFetch<ReadRequest, ReadResponse> + 'static,
        batch_size: usize,
    ) -> Self {
        Self::with_executor(ReadExecutor::batched(fetch, batch_size))
    }

    /// An engine over a prepared executor.
    pub fn with_executor(executor: ReadExecutor) -> Self {
        QueryEngine {
            executor,
            tree: CacheTree::default(),
            index: ReverseIndex::default(),
            spec: None,
            root: None,
        }
    }

    /// (Re)compute the query and report the complete current result set
    /// to `visitor`, pre-order, roots in spec order.
    ///
    /// Passing a different spec or root than last time discards the
    /// cache tree and rebuilds it lazily against the new query; passing
    /// the same one revalidates only paths marked by [`invalidate`].
    ///
    /// On error nothing is reported, finished portions of the pass stay
    /// cached, and the next call resumes from the unfinished remainder.
    ///
    /// [`invalidate`]: QueryEngine::invalidate
    pub fn validate(
        &mut self,
        spec: &QuerySpec,
        root: NodeRef,
        mut visitor: impl FnMut(NodeRef),
    ) -> Result<(), StreamError> {
        if self.spec.as_ref() != Some(spec) || self.root != Some(root) {
            tracing::debug!(%root, "query changed, discarding cache tree");
            self.tree = CacheTree::default();
            self.index.clear();
            self.spec = Some(spec.clone());
            self.root = Some(root);
        }
        self.tree.validate(&self.executor, spec, root, &mut self.index)?;
        for node in self.tree.results() {
            visitor(node);
        }
        Ok(())
    }

    /// Mark the cache nodes that read any of the changed identities for
    /// revalidation. Identities nothing read are ignored.
    pub fn invalidate(&mut self, changed: impl IntoIterator<Item = NodeRef>) {
        let mut hits = 0usize;
        for node in changed {
            for id in self.index.lookup(node) {
                self.tree.invalidate(id);
                hits += 1;
            }
        }
        tracing::debug!(hits, "applied change notifications");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryModel;
    use crate::query::{StepKind, Subquery};

    #[test]
    fn switching_specs_rebuilds_lazily() {
        let model = MemoryModel::new();
        let root = model.add_root("Root");
        let a = model.add_child(root, "items", "Folder");
        let a1 = model.add_child(a, "items", "File");

        let mut engine = QueryEngine::direct(model);
        let children = QuerySpec::single(Subquery::new(StepKind::AllChildren));
        let descendants = QuerySpec::single(Subquery::new(StepKind::Descendants));

        let mut found = Vec::new();
        engine.validate(&children, root, |n| found.push(n)).unwrap();
        assert_eq!(found, vec![a]);

        let mut found = Vec::new();
        engine
            .validate(&descendants, root, |n| found.push(n))
            .unwrap();
        assert_eq!(found, vec![a, a1]);

        // And back again: the tree is rebuilt against the earlier spec.
        let mut found = Vec::new();
        engine.validate(&children, root, |n| found.push(n)).unwrap();
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn unknown_changes_are_ignored() {
        let model = MemoryModel::new();
        let root = model.add_root("Root");
        let mut engine = QueryEngine::direct(model);
        let spec = QuerySpec::single(Subquery::new(StepKind::AllChildren));
        engine.validate(&spec, root, |_| {}).unwrap();
        engine.invalidate([NodeRef::new(12345)]);
        let mut found = Vec::new();
        engine.validate(&spec, root, |n| found.push(n)).unwrap();
        assert!(found.is_empty());
    }
}
