//! End-to-end incremental query scenarios: precision of invalidation,
//! cached-pass cost, and recomputation locality.

use std::sync::Arc;

use parking_lot::Mutex;
use treeql::{
    evaluate_spec, Filter, MemoryModel, ModelReadError, ModelReader, NodeRef, PropertyOp,
    QueryEngine, QuerySpec, ReadExecutor, RoleId, StepKind, Subquery,
};

/// Delegating model that records the subject of every read.
#[derive(Clone)]
struct CountingModel {
    inner: MemoryModel,
    reads: Arc<Mutex<Vec<NodeRef>>>,
}

impl CountingModel {
    fn new(inner: MemoryModel) -> Self {
        CountingModel {
            inner,
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn take_reads(&self) -> Vec<NodeRef> {
        std::mem::take(&mut *self.reads.lock())
    }

    fn record(&self, node: NodeRef) {
        self.reads.lock().push(node);
    }
}

impl ModelReader for CountingModel {
    fn all_children(&self, node: NodeRef) -> Result<Vec<NodeRef>, ModelReadError> {
        self.record(node);
        self.inner.all_children(node)
    }

    fn children(&self, node: NodeRef, role: &RoleId) -> Result<Vec<NodeRef>, ModelReadError> {
        self.record(node);
        self.inner.children(node, role)
    }

    fn parent(&self, node: NodeRef) -> Result<Option<NodeRef>, ModelReadError> {
        self.record(node);
        self.inner.parent(node)
    }

    fn reference_target(
        &self,
        node: NodeRef,
        role: &RoleId,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        self.record(node);
        self.inner.reference_target(node, role)
    }

    fn reference_roles(&self, node: NodeRef) -> Result<Vec<RoleId>, ModelReadError> {
        self.record(node);
        self.inner.reference_roles(node)
    }

    fn property(
        &self,
        node: NodeRef,
        role: &RoleId,
    ) -> Result<Option<String>, ModelReadError> {
        self.record(node);
        self.inner.property(node, role)
    }

    fn concept(&self, node: NodeRef) -> Result<Option<treeql::ConceptId>, ModelReadError> {
        self.record(node);
        self.inner.concept(node)
    }

    fn resolve_id(
        &self,
        scope: NodeRef,
        serialized: &str,
    ) -> Result<Option<NodeRef>, ModelReadError> {
        self.record(scope);
        self.inner.resolve_id(scope, serialized)
    }
}

fn collect(engine: &mut QueryEngine, spec: &QuerySpec, root: NodeRef) -> Vec<NodeRef> {
    let mut found = Vec::new();
    engine
        .validate(spec, root, |node| found.push(node))
        .expect("validation");
    found
}

fn scratch(model: &MemoryModel, spec: &QuerySpec, root: NodeRef) -> Vec<NodeRef> {
    let executor = ReadExecutor::direct(model.clone());
    evaluate_spec(&executor, spec, root).expect("scratch evaluation")
}

#[test_log::test]
fn renaming_a_sibling_does_not_reread_the_other_subtree() {
    let model = MemoryModel::new();
    let root = model.add_root("fs.Root");
    let a = model.add_child(root, "items", "fs.Folder");
    let a1 = model.add_child(a, "items", "fs.File");
    let _a2 = model.add_child(a1, "items", "fs.File");
    let b = model.add_child(root, "items", "fs.File");

    let counting = CountingModel::new(model.clone());
    let mut engine = QueryEngine::direct(counting.clone());
    let spec = QuerySpec::single(
        Subquery::new(StepKind::Descendants).filtered(Filter::ConceptName("Folder".into())),
    );

    assert_eq!(collect(&mut engine, &spec, root), vec![a]);
    counting.take_reads();
    model.changes().drain();

    model.set_concept(b, "fs.Folder");
    engine.invalidate(model.changes().drain());
    assert_eq!(collect(&mut engine, &spec, root), vec![a, b]);

    let reads = counting.take_reads();
    assert!(!reads.is_empty(), "the edited node is re-read");
    assert!(
        reads.iter().all(|read| *read == b),
        "only the edited node is re-read, not the sibling subtree: {reads:?}"
    );
}

#[test]
fn a_fully_clean_pass_reads_nothing() {
    let model = MemoryModel::new();
    let root = model.add_root("fs.Root");
    let folder = model.add_child(root, "items", "fs.Folder");
    let _file = model.add_child(folder, "items", "fs.File");

    let counting = CountingModel::new(model.clone());
    let mut engine = QueryEngine::direct(counting.clone());
    let spec = QuerySpec::single(Subquery::new(StepKind::Descendants));

    let first = collect(&mut engine, &spec, root);
    counting.take_reads();

    // No invalidation in between: the pass is answered from the cache.
    let second = collect(&mut engine, &spec, root);
    assert_eq!(first, second);
    assert!(
        counting.take_reads().is_empty(),
        "a clean revalidation performs zero model reads"
    );
}

#[test_log::test]
fn incremental_results_match_scratch_evaluation_across_edits() {
    let model = MemoryModel::new();
    let root = model.add_root("fs.Root");
    let docs = model.add_child(root, "items", "fs.Folder");
    let src = model.add_child(root, "items", "fs.Folder");
    let readme = model.add_child(docs, "items", "fs.File");
    let main = model.add_child(src, "items", "fs.File");
    model.set_property(main, "name", "main.rs");

    let spec = QuerySpec::single(
        Subquery::new(StepKind::Descendants)
            .filtered(Filter::ConceptName("Folder".into()))
            .with_child(
                Subquery::new(StepKind::AllChildren).filtered(Filter::Property {
                    role: "name".into(),
                    op: PropertyOp::IsSet,
                    value: String::new(),
                }),
            ),
    );

    let mut engine = QueryEngine::direct(model.clone());
    model.changes().drain();

    let edits: Vec<Box<dyn Fn(&MemoryModel)>> = vec![
        Box::new(move |m| m.set_property(readme, "name", "README.md")),
        Box::new(move |m| m.set_concept(readme, "fs.Folder")),
        Box::new(move |m| {
            m.add_child(docs, "items", "fs.Folder");
        }),
        Box::new(move |m| m.set_property(main, "name", "lib.rs")),
        Box::new(move |m| m.remove_node(main)),
        Box::new(move |m| m.set_concept(src, "fs.Archive")),
    ];

    assert_eq!(collect(&mut engine, &spec, root), scratch(&model, &spec, root));
    for edit in edits {
        edit(&model);
        engine.invalidate(model.changes().drain());
        assert_eq!(
            collect(&mut engine, &spec, root),
            scratch(&model, &spec, root),
            "incremental result diverged from scratch evaluation"
        );
    }
}

#[test]
fn ancestors_and_references_stay_incremental() {
    let model = MemoryModel::new();
    let root = model.add_root("fs.Root");
    let folder = model.add_child(root, "items", "fs.Folder");
    let file = model.add_child(folder, "items", "fs.File");
    let link = model.add_child(root, "items", "fs.Link");
    model.set_reference(link, "target", file);

    let ancestors = QuerySpec::single(Subquery::new(StepKind::Ancestors));
    let mut engine = QueryEngine::direct(model.clone());
    assert_eq!(collect(&mut engine, &ancestors, file), vec![folder, root]);

    let references = QuerySpec::single(Subquery::new(StepKind::AllReferences));
    let mut engine = QueryEngine::direct(model.clone());
    assert_eq!(collect(&mut engine, &references, link), vec![file]);

    // Retargeting the link is one change notification away.
    model.changes().drain();
    model.set_reference(link, "target", folder);
    engine.invalidate(model.changes().drain());
    assert_eq!(collect(&mut engine, &references, link), vec![folder]);
}

#[test]
fn removed_results_disappear_and_survivors_keep_their_subtrees() {
    let model = MemoryModel::new();
    let root = model.add_root("fs.Root");
    let keep = model.add_child(root, "items", "fs.Folder");
    let keep_inner = model.add_child(keep, "items", "fs.File");
    let drop_ = model.add_child(root, "items", "fs.Folder");
    let _drop_inner = model.add_child(drop_, "items", "fs.File");

    let counting = CountingModel::new(model.clone());
    let mut engine = QueryEngine::direct(counting.clone());
    let spec = QuerySpec::single(Subquery::new(StepKind::Descendants));

    let all = collect(&mut engine, &spec, root);
    assert_eq!(all.len(), 4);
    counting.take_reads();
    model.changes().drain();

    model.remove_node(drop_);
    engine.invalidate(model.changes().drain());
    assert_eq!(collect(&mut engine, &spec, root), vec![keep, keep_inner]);

    // The surviving subtree was reused, not re-read.
    let reads = counting.take_reads();
    assert!(
        !reads.contains(&keep_inner),
        "the surviving subtree is not re-read: {reads:?}"
    );
}

#[test]
fn batched_engine_agrees_with_direct() {
    let model = MemoryModel::new();
    let root = model.add_root("fs.Root");
    let docs = model.add_child(root, "items", "fs.Folder");
    for i in 0..6 {
        let concept = if i % 2 == 0 { "fs.Folder" } else { "fs.File" };
        model.add_child(docs, "items", concept);
    }

    let spec = QuerySpec::single(
        Subquery::new(StepKind::Descendants).filtered(Filter::ConceptName("Folder".into())),
    );

    let mut direct = QueryEngine::direct(model.clone());
    let mut batched = QueryEngine::batched(treeql::ModelFetch::new(model.clone()), 3);
    assert_eq!(
        collect(&mut direct, &spec, root),
        collect(&mut batched, &spec, root)
    );

    model.changes().drain();
    model.set_concept(docs, "fs.Archive");
    let changed: Vec<_> = model.changes().drain();
    direct.invalidate(changed.clone());
    batched.invalidate(changed);
    assert_eq!(
        collect(&mut direct, &spec, root),
        collect(&mut batched, &spec, root)
    );
}
