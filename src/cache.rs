//! The cache validation tree.
//!
//! The tree mirrors the shape of an evaluated query: one node per root
//! query, one per produced result, one per nested subquery. Each node
//! carries two flags: `valid` ("my own result set / filter outcome is
//! current") and `dirty_subtree` ("something below me needs another
//! look"). Separating them lets a pass skip a clean subtree in O(1)
//! instead of walking it to discover nothing changed, so a single edit
//! never forces re-evaluation of an unrelated sibling subtree.
//!
//! Nodes live in a [`Slab`] arena and refer to each other by index: the
//! parent link is an index, children own their subtrees through index
//! lists, and destroying a subtree frees its slots.
//!
//! Revalidation walks the tree level by level and recomputes every
//! invalid node of a level in a single batching session, so under a
//! bulk executor one round trip serves a whole level of the tree.
//!
//! Recursive steps (descendants, ancestors) expand node by node: a
//! result node produced by such a step re-fetches only its own frontier
//! (its children, or its parent), and the produced results become
//! frontier children that expand further. An edit near one leaf
//! therefore re-reads that leaf's surroundings, not the whole traversal.

use slab::Slab;

use crate::error::StreamError;
use crate::eval::{
    immediate_step, is_recursive, run_plans, ReadExecutor, ReadLog, RecomputeOutcome,
    RecomputePlan,
};
use crate::index::ReverseIndex;
use crate::model::NodeRef;
use crate::query::{QuerySpec, Subquery};

/// Arena index of a cache node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct CacheNodeId(usize);

impl CacheNodeId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: usize) -> Self {
        CacheNodeId(raw)
    }
}

#[derive(Clone, Copy)]
enum CacheNodeKind {
    /// Mirrors one root query of the spec.
    Root { root_index: usize },
    /// Mirrors one node produced by the parent's step.
    Result { node: NodeRef, passing: bool },
    /// Mirrors one nested subquery under a passing result.
    Subquery { child_index: usize },
}

struct CacheNodeData {
    kind: CacheNodeKind,
    parent: Option<CacheNodeId>,
    /// Result children for step nodes; subquery children for result
    /// nodes (present only while the result passes its filters).
    children: Vec<CacheNodeId>,
    /// Continuation results of a recursive step. Kept even when the
    /// result fails its filters: filters select results, they do not
    /// prune the traversal.
    frontier: Vec<CacheNodeId>,
    valid: bool,
    dirty_subtree: bool,
    /// Identities read by this node's own recomputation.
    reads: Vec<NodeRef>,
    /// Passing results of this subtree in pre-order, reused while clean.
    contribution: Vec<NodeRef>,
}

/// One node of the current validation level, with its query context.
#[derive(Clone, Copy)]
enum VisitItem<'s> {
    /// A root query or nested subquery node, evaluated from `source`.
    Step {
        id: CacheNodeId,
        sub: &'s Subquery,
        source: NodeRef,
    },
    /// A produced result node.
    Result { id: CacheNodeId, sub: &'s Subquery },
}

impl VisitItem<'_> {
    fn id(&self) -> CacheNodeId {
        match self {
            VisitItem::Step { id, .. } | VisitItem::Result { id, .. } => *id,
        }
    }
}

enum ResultList {
    Children,
    Frontier,
}

/// The validation tree for one (spec, root) pair.
#[derive(Default)]
pub(crate) struct CacheTree {
    arena: Slab<CacheNodeData>,
    roots: Vec<CacheNodeId>,
}

impl CacheTree {
    fn create_node(&mut self, kind: CacheNodeKind, parent: Option<CacheNodeId>) -> CacheNodeId {
        CacheNodeId(self.arena.insert(CacheNodeData {
            kind,
            parent,
            children: Vec::new(),
            frontier: Vec::new(),
            valid: false,
            dirty_subtree: true,
            reads: Vec::new(),
            contribution: Vec::new(),
        }))
    }

    fn result_node_of(&self, id: CacheNodeId) -> NodeRef {
        match self.arena[id.0].kind {
            CacheNodeKind::Result { node, .. } => node,
            _ => unreachable!("result lists hold result nodes only"),
        }
    }

    /// Mark one cache node invalid and the path above it dirty. Stops at
    /// the first ancestor that is already marked.
    pub fn invalidate(&mut self, id: CacheNodeId) {
        if !self.arena.contains(id.0) {
            return;
        }
        let parent = {
            let node = &mut self.arena[id.0];
            node.valid = false;
            node.dirty_subtree = true;
            node.parent
        };
        let mut current = parent;
        while let Some(ancestor) = current {
            let node = &mut self.arena[ancestor.0];
            if node.dirty_subtree {
                break;
            }
            node.dirty_subtree = true;
            current = node.parent;
        }
    }

    /// Bring the whole tree up to date, touching only dirty paths.
    pub fn validate(
        &mut self,
        executor: &ReadExecutor,
        spec: &QuerySpec,
        root: NodeRef,
        index: &mut ReverseIndex,
    ) -> Result<(), StreamError> {
        if self.roots.is_empty() {
            for root_index in 0..spec.roots().len() {
                let id = self.create_node(CacheNodeKind::Root { root_index }, None);
                self.roots.push(id);
            }
        }
        let items = self
            .roots
            .iter()
            .map(|&id| {
                let CacheNodeKind::Root { root_index } = self.arena[id.0].kind else {
                    unreachable!("tree roots are root nodes");
                };
                VisitItem::Step {
                    id,
                    sub: &spec.roots()[root_index],
                    source: root,
                }
            })
            .collect();
        self.validate_level(items, executor, index)
    }

    /// The passing results of the current tree, pre-order, roots in spec
    /// order.
    pub fn results(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.roots
            .iter()
            .flat_map(|id| self.arena[id.0].contribution.iter().copied())
    }

    /// Validate one level of the tree, then its children, then settle
    /// this level's contributions. Every invalid node of the level
    /// recomputes inside one batching session.
    fn validate_level(
        &mut self,
        items: Vec<VisitItem<'_>>,
        executor: &ReadExecutor,
        index: &mut ReverseIndex,
    ) -> Result<(), StreamError> {
        let mut active = Vec::with_capacity(items.len());
        for item in items {
            let node = &self.arena[item.id().0];
            if node.valid && !node.dirty_subtree {
                continue;
            }
            active.push(item);
        }
        if active.is_empty() {
            return Ok(());
        }

        self.recompute_invalid(&active, executor, index)?;

        let mut next = Vec::new();
        for item in &active {
            match *item {
                VisitItem::Step { id, sub, .. } => {
                    for &child in &self.arena[id.0].children {
                        next.push(VisitItem::Result { id: child, sub });
                    }
                }
                VisitItem::Result { id, sub } => {
                    let node = self.result_node_of(id);
                    for &child in &self.arena[id.0].children {
                        let CacheNodeKind::Subquery { child_index } = self.arena[child.0].kind
                        else {
                            unreachable!("result children are subquery nodes");
                        };
                        next.push(VisitItem::Step {
                            id: child,
                            sub: &sub.children()[child_index],
                            source: node,
                        });
                    }
                    for &child in &self.arena[id.0].frontier {
                        next.push(VisitItem::Result { id: child, sub });
                    }
                }
            }
        }
        self.validate_level(next, executor, index)?;

        for item in &active {
            self.finish(item.id());
        }
        Ok(())
    }

    /// Recompute every invalid node among `active` in one session and
    /// apply the outcomes to the tree.
    fn recompute_invalid(
        &mut self,
        active: &[VisitItem<'_>],
        executor: &ReadExecutor,
        index: &mut ReverseIndex,
    ) -> Result<(), StreamError> {
        let mut pending: Vec<(usize, ReadLog)> = Vec::new();
        let mut plans: Vec<RecomputePlan> = Vec::new();
        for (position, item) in active.iter().enumerate() {
            if self.arena[item.id().0].valid {
                continue;
            }
            let log = ReadLog::default();
            let plan = match *item {
                VisitItem::Step { sub, source, .. } => RecomputePlan::Step {
                    source,
                    step: immediate_step(sub.step()),
                    log: log.clone(),
                },
                VisitItem::Result { id, sub } => RecomputePlan::Result {
                    node: self.result_node_of(id),
                    filters: sub.filters().to_vec(),
                    frontier_step: is_recursive(sub.step())
                        .then(|| immediate_step(sub.step())),
                    log: log.clone(),
                },
            };
            pending.push((position, log));
            plans.push(plan);
        }
        if plans.is_empty() {
            return Ok(());
        }

        tracing::trace!(count = plans.len(), "recomputing level");
        let outcomes = run_plans(executor, plans)?;

        for ((position, log), outcome) in pending.into_iter().zip(outcomes) {
            let mut reads = log.take();
            match (active[position], outcome) {
                (VisitItem::Step { id, .. }, RecomputeOutcome::Produced(produced)) => {
                    self.replace_reads(id, reads, index);
                    self.sync_results(id, &produced, ResultList::Children, index);
                    self.arena[id.0].valid = true;
                }
                (
                    VisitItem::Result { id, sub },
                    RecomputeOutcome::Filtered { passing, frontier },
                ) => {
                    let node = self.result_node_of(id);
                    // The represented identity itself: any change to the
                    // node can flip its filters or its frontier.
                    reads.push(node);
                    self.replace_reads(id, reads, index);
                    if let CacheNodeKind::Result { passing: stored, .. } =
                        &mut self.arena[id.0].kind
                    {
                        *stored = passing;
                    }
                    if passing {
                        self.ensure_subquery_children(id, sub.children().len());
                    } else {
                        self.clear_subquery_children(id, index);
                    }
                    if let Some(produced) = frontier {
                        self.sync_results(id, &produced, ResultList::Frontier, index);
                    }
                    self.arena[id.0].valid = true;
                }
                _ => unreachable!("outcome kind follows plan kind"),
            }
        }
        Ok(())
    }

    /// Rebuild the cached contribution and clear the dirty flag once a
    /// node and its children are fully valid.
    fn finish(&mut self, id: CacheNodeId) {
        let (own, children, frontier) = {
            let data = &self.arena[id.0];
            let own = match data.kind {
                CacheNodeKind::Result {
                    node,
                    passing: true,
                } => Some(node),
                _ => None,
            };
            (own, data.children.clone(), data.frontier.clone())
        };
        let mut contribution = Vec::new();
        contribution.extend(own);
        for child in children.into_iter().chain(frontier) {
            contribution.extend(self.arena[child.0].contribution.iter().copied());
        }
        let data = &mut self.arena[id.0];
        data.contribution = contribution;
        data.dirty_subtree = false;
    }

    fn replace_reads(&mut self, id: CacheNodeId, reads: Vec<NodeRef>, index: &mut ReverseIndex) {
        let old = std::mem::replace(&mut self.arena[id.0].reads, reads);
        index.forget(id, &old);
        index.record(id, &self.arena[id.0].reads);
    }

    /// Diff a produced result set against the existing result children,
    /// reusing nodes whose identity survived (their subtree validity
    /// survives with them), destroying vanished ones, creating fresh
    /// (unvalidated) ones, and keeping the produced order.
    fn sync_results(
        &mut self,
        id: CacheNodeId,
        produced: &[NodeRef],
        list: ResultList,
        index: &mut ReverseIndex,
    ) {
        let existing = match list {
            ResultList::Children => self.arena[id.0].children.clone(),
            ResultList::Frontier => self.arena[id.0].frontier.clone(),
        };
        let mut by_node: ahash::HashMap<NodeRef, Vec<CacheNodeId>> = ahash::HashMap::default();
        for child in existing {
            by_node.entry(self.result_node_of(child)).or_default().push(child);
        }
        let mut next = Vec::with_capacity(produced.len());
        for &node in produced {
            let reused = by_node
                .get_mut(&node)
                .and_then(|pool| if pool.is_empty() { None } else { Some(pool.remove(0)) });
            match reused {
                Some(kept) => next.push(kept),
                None => next.push(self.create_node(
                    CacheNodeKind::Result {
                        node,
                        passing: false,
                    },
                    Some(id),
                )),
            }
        }
        for pool in by_node.into_values() {
            for vanished in pool {
                self.destroy_subtree(vanished, index);
            }
        }
        match list {
            ResultList::Children => self.arena[id.0].children = next,
            ResultList::Frontier => self.arena[id.0].frontier = next,
        }
    }

    fn ensure_subquery_children(&mut self, id: CacheNodeId, count: usize) {
        if !self.arena[id.0].children.is_empty() {
            return;
        }
        let created: Vec<CacheNodeId> = (0..count)
            .map(|child_index| self.create_node(CacheNodeKind::Subquery { child_index }, Some(id)))
            .collect();
        self.arena[id.0].children = created;
    }

    fn clear_subquery_children(&mut self, id: CacheNodeId, index: &mut ReverseIndex) {
        for child in std::mem::take(&mut self.arena[id.0].children) {
            self.destroy_subtree(child, index);
        }
    }

    fn destroy_subtree(&mut self, id: CacheNodeId, index: &mut ReverseIndex) {
        let data = self.arena.remove(id.0);
        index.forget(id, &data.reads);
        for child in data.children.into_iter().chain(data.frontier) {
            self.destroy_subtree(child, index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::ReadExecutor;
    use crate::memory::MemoryModel;
    use crate::query::{Filter, StepKind};

    fn validate_all(
        tree: &mut CacheTree,
        executor: &ReadExecutor,
        spec: &QuerySpec,
        root: NodeRef,
        index: &mut ReverseIndex,
    ) -> Vec<NodeRef> {
        tree.validate(executor, spec, root, index).unwrap();
        tree.results().collect()
    }

    #[test]
    fn reused_children_keep_their_validity() {
        let model = MemoryModel::new();
        let root = model.add_root("Root");
        let a = model.add_child(root, "items", "Folder");
        let b = model.add_child(root, "items", "File");
        let executor = ReadExecutor::direct(model.clone());
        let spec = QuerySpec::single(Subquery::new(StepKind::AllChildren));

        let mut tree = CacheTree::default();
        let mut index = ReverseIndex::default();
        let out = validate_all(&mut tree, &executor, &spec, root, &mut index);
        assert_eq!(out, vec![a, b]);

        // A new sibling appears; existing result nodes survive the diff.
        let c = model.add_child(root, "items", "File");
        for id in index.lookup(root) {
            tree.invalidate(id);
        }
        let out = validate_all(&mut tree, &executor, &spec, root, &mut index);
        assert_eq!(out, vec![a, b, c]);
    }

    #[test]
    fn failing_results_survive_to_flip_later() {
        let model = MemoryModel::new();
        let root = model.add_root("Root");
        let a = model.add_child(root, "items", "Folder");
        let b = model.add_child(root, "items", "File");
        let executor = ReadExecutor::direct(model.clone());
        let spec = QuerySpec::single(
            Subquery::new(StepKind::AllChildren).filtered(Filter::ConceptName("Folder".into())),
        );

        let mut tree = CacheTree::default();
        let mut index = ReverseIndex::default();
        let out = validate_all(&mut tree, &executor, &spec, root, &mut index);
        assert_eq!(out, vec![a]);

        // The failing result node still tracks b, so a concept change is
        // enough to bring it into the result set.
        model.set_concept(b, "Folder");
        let hits = index.lookup(b);
        assert!(!hits.is_empty());
        for id in hits {
            tree.invalidate(id);
        }
        let out = validate_all(&mut tree, &executor, &spec, root, &mut index);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn destroyed_subtrees_leave_no_index_entries() {
        let model = MemoryModel::new();
        let root = model.add_root("Root");
        let a = model.add_child(root, "items", "Folder");
        let a1 = model.add_child(a, "items", "File");
        let executor = ReadExecutor::direct(model.clone());
        let spec = QuerySpec::single(Subquery::new(StepKind::Descendants));

        let mut tree = CacheTree::default();
        let mut index = ReverseIndex::default();
        let out = validate_all(&mut tree, &executor, &spec, root, &mut index);
        assert_eq!(out, vec![a, a1]);

        model.remove_node(a);
        for changed in [root, a, a1] {
            for id in index.lookup(changed) {
                tree.invalidate(id);
            }
        }
        let out = validate_all(&mut tree, &executor, &spec, root, &mut index);
        assert!(out.is_empty());
        assert!(!index.contains(a1), "entries of destroyed nodes are gone");
    }
}
