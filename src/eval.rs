//! Query evaluation over the narrow model interface.
//!
//! [`Evaluator`] expresses every traversal step and filter as a stream
//! expression over a [`FetchSession`], so the same logic runs against a
//! local model (direct session, reads answered immediately) or a remote
//! one (bulk session, reads coalesced into batches). The evaluator never
//! mutates cache state; it is a pure read of the model.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bulk::{
    BatchFetch, BulkExecutor, BulkSession, DirectExecutor, DirectSession, FetchSession,
};
use crate::error::{ModelReadError, StreamError};
use crate::model::{ConceptId, ModelReader, NodeRef, RoleId};
use crate::query::{Filter, QuerySpec, StepKind, Subquery};
use crate::stream::{Many, One, ZeroOrOne};

/// One point read against the model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReadRequest {
    /// All children of a node across all roles.
    AllChildren(NodeRef),
    /// Children of a node in one role.
    Children(NodeRef, RoleId),
    /// The containing parent of a node.
    Parent(NodeRef),
    /// The target of one reference role.
    ReferenceTarget(NodeRef, RoleId),
    /// All populated reference roles of a node.
    ReferenceRoles(NodeRef),
    /// A property value of a node.
    Property(NodeRef, RoleId),
    /// The concept of a node.
    Concept(NodeRef),
    /// Resolution of a serialized identity in a node's scope.
    Resolve(NodeRef, String),
}

impl ReadRequest {
    /// The node identity whose data the request reads. A change to this
    /// node can change the answer.
    pub fn subject(&self) -> NodeRef {
        match self {
            ReadRequest::AllChildren(node)
            | ReadRequest::Children(node, _)
            | ReadRequest::Parent(node)
            | ReadRequest::ReferenceTarget(node, _)
            | ReadRequest::ReferenceRoles(node)
            | ReadRequest::Property(node, _)
            | ReadRequest::Concept(node)
            | ReadRequest::Resolve(node, _) => *node,
        }
    }
}

/// The answer to one point read. A request absent from a batch result is
/// interpreted as the not-found answer for its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResponse {
    /// An ordered list of nodes.
    Nodes(Vec<NodeRef>),
    /// Zero or one node.
    MaybeNode(Option<NodeRef>),
    /// An ordered list of roles.
    Roles(Vec<RoleId>),
    /// A property value, if set.
    Text(Option<String>),
    /// A concept token, if known.
    Concept(Option<ConceptId>),
}

/// Answers read requests from a [`ModelReader`], one key at a time.
///
/// This is the local-model backend for [`ReadExecutor::direct`]; remote
/// models supply their own [`BatchFetch`] that ships keys over the wire.
pub struct ModelFetch<M> {
    model: M,
}

impl<M: ModelReader> ModelFetch<M> {
    /// Wrap a model.
    pub fn new(model: M) -> Self {
        ModelFetch { model }
    }

    fn answer(&self, request: &ReadRequest) -> Result<Option<ReadResponse>, ModelReadError> {
        let answered = match request {
            ReadRequest::AllChildren(node) => {
                self.model.all_children(*node).map(ReadResponse::Nodes)
            }
            ReadRequest::Children(node, role) => {
                self.model.children(*node, role).map(ReadResponse::Nodes)
            }
            ReadRequest::Parent(node) => self.model.parent(*node).map(ReadResponse::MaybeNode),
            ReadRequest::ReferenceTarget(node, role) => self
                .model
                .reference_target(*node, role)
                .map(ReadResponse::MaybeNode),
            ReadRequest::ReferenceRoles(node) => {
                self.model.reference_roles(*node).map(ReadResponse::Roles)
            }
            ReadRequest::Property(node, role) => {
                self.model.property(*node, role).map(ReadResponse::Text)
            }
            ReadRequest::Concept(node) => self.model.concept(*node).map(ReadResponse::Concept),
            ReadRequest::Resolve(scope, serialized) => self
                .model
                .resolve_id(*scope, serialized)
                .map(ReadResponse::MaybeNode),
        };
        match answered {
            Ok(response) => Ok(Some(response)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl<M: ModelReader> BatchFetch<ReadRequest, ReadResponse> for ModelFetch<M> {
    fn execute(
        &self,
        keys: Vec<ReadRequest>,
    ) -> anyhow::Result<HashMap<ReadRequest, ReadResponse>> {
        let mut answers = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(response) = self.answer(&key)? {
                answers.insert(key, response);
            }
        }
        Ok(answers)
    }
}

/// A session over model reads, direct or bulk-batched.
#[derive(Clone)]
pub enum ReadSession {
    /// Reads answered immediately.
    Direct(DirectSession<ReadRequest, ReadResponse>),
    /// Reads coalesced into batches.
    Bulk(BulkSession<ReadRequest, ReadResponse>),
}

impl FetchSession<ReadRequest, ReadResponse> for ReadSession {
    fn enqueue(&self, key: ReadRequest) -> ZeroOrOne<ReadResponse> {
        match self {
            ReadSession::Direct(session) => session.enqueue(key),
            ReadSession::Bulk(session) => session.enqueue(key),
        }
    }
}

/// Executor for model reads, wrapping either backend behind one entry
/// point so callers build their expressions once.
pub enum ReadExecutor {
    /// Immediate reads from a local model.
    Direct(DirectExecutor<ReadRequest, ReadResponse>),
    /// Batched reads through an injected fetch function.
    Bulk(BulkExecutor<ReadRequest, ReadResponse>),
}

impl ReadExecutor {
    /// Immediate reads from a local model.
    pub fn direct(model: impl ModelReader + 'static) -> Self {
        ReadExecutor::Direct(DirectExecutor::new(ModelFetch::new(model)))
    }

    /// Batched reads through an injected fetch function.
    pub fn batched(
        fetch: impl BatchFetch<ReadRequest, ReadResponse> + 'static,
        batch_size: usize,
    ) -> Self {
        ReadExecutor::Bulk(BulkExecutor::new(fetch).with_batch_size(batch_size))
    }

    /// Run a many-valued expression and collect its values.
    pub fn collect<T: 'static>(
        &self,
        build: impl FnOnce(ReadSession) -> Many<T>,
    ) -> Result<Vec<T>, StreamError> {
        match self {
            ReadExecutor::Direct(ex) => ex.collect(|s| build(ReadSession::Direct(s.clone()))),
            ReadExecutor::Bulk(ex) => ex.collect(|s| build(ReadSession::Bulk(s.clone()))),
        }
    }

    /// Run a single-valued expression.
    pub fn query<T: 'static>(
        &self,
        build: impl FnOnce(ReadSession) -> One<T>,
    ) -> Result<T, StreamError> {
        match self {
            ReadExecutor::Direct(ex) => ex.query(|s| build(ReadSession::Direct(s.clone()))),
            ReadExecutor::Bulk(ex) => ex.query(|s| build(ReadSession::Bulk(s.clone()))),
        }
    }
}

/// Log of the node identities read while evaluating one expression.
#[derive(Clone, Default)]
pub(crate) struct ReadLog(Arc<Mutex<Vec<NodeRef>>>);

impl ReadLog {
    fn record(&self, node: NodeRef) {
        self.0.lock().push(node);
    }

    pub(crate) fn take(&self) -> Vec<NodeRef> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Session wrapper that records the subject of every issued read.
#[derive(Clone)]
pub(crate) struct RecordingSession<S> {
    inner: S,
    log: ReadLog,
}

impl<S> RecordingSession<S> {
    pub(crate) fn new(inner: S, log: ReadLog) -> Self {
        RecordingSession { inner, log }
    }
}

impl<S: FetchSession<ReadRequest, ReadResponse>> FetchSession<ReadRequest, ReadResponse>
    for RecordingSession<S>
{
    fn enqueue(&self, key: ReadRequest) -> ZeroOrOne<ReadResponse> {
        self.log.record(key.subject());
        self.inner.enqueue(key)
    }
}

/// Evaluates traversal steps and filters as stream expressions.
#[derive(Clone)]
pub struct Evaluator<S> {
    session: S,
}

impl<S> Evaluator<S>
where
    S: FetchSession<ReadRequest, ReadResponse> + Clone + 'static,
{
    /// Create an evaluator over a session.
    pub fn new(session: S) -> Self {
        Evaluator { session }
    }

    fn nodes(&self, request: ReadRequest) -> Many<NodeRef> {
        self.session
            .enqueue(request)
            .map(|response| match response {
                ReadResponse::Nodes(nodes) => nodes,
                _ => Vec::new(),
            })
            .or_value(Vec::new())
            .flatten_many()
    }

    fn maybe_node(&self, request: ReadRequest) -> ZeroOrOne<NodeRef> {
        self.session.enqueue(request).flat_map(|response| {
            match response {
                ReadResponse::MaybeNode(node) => ZeroOrOne::of(node),
                _ => ZeroOrOne::none(),
            }
        })
    }

    fn roles(&self, request: ReadRequest) -> Many<RoleId> {
        self.session
            .enqueue(request)
            .map(|response| match response {
                ReadResponse::Roles(roles) => roles,
                _ => Vec::new(),
            })
            .or_value(Vec::new())
            .flatten_many()
    }

    fn property_of(&self, node: NodeRef, role: RoleId) -> One<Option<String>> {
        self.session
            .enqueue(ReadRequest::Property(node, role))
            .map(|response| match response {
                ReadResponse::Text(value) => value,
                _ => None,
            })
            .or_value(None)
    }

    fn concept_of(&self, node: NodeRef) -> One<Option<ConceptId>> {
        self.session
            .enqueue(ReadRequest::Concept(node))
            .map(|response| match response {
                ReadResponse::Concept(concept) => concept,
                _ => None,
            })
            .or_value(None)
    }

    /// The nodes a step produces from `node`, in step order.
    pub fn step(&self, node: NodeRef, step: &StepKind) -> Many<NodeRef> {
        match step {
            StepKind::AllChildren => self.nodes(ReadRequest::AllChildren(node)),
            StepKind::ChildrenOfRole(role) => {
                self.nodes(ReadRequest::Children(node, role.clone()))
            }
            StepKind::Descendants => self.descendants(node),
            StepKind::Ancestors => self.ancestors(node),
            StepKind::Parent => self.maybe_node(ReadRequest::Parent(node)).into_many(),
            StepKind::ReferenceOfRole(role) => self
                .maybe_node(ReadRequest::ReferenceTarget(node, role.clone()))
                .into_many(),
            StepKind::AllReferences => self.all_references(node),
            StepKind::ById(serialized) => self
                .maybe_node(ReadRequest::Resolve(node, serialized.clone()))
                .into_many(),
            StepKind::RootNode => Many::of(vec![node]),
        }
    }

    /// All transitive children in pre-order, excluding `node`. Each level
    /// of the traversal issues its reads together, so batched sessions
    /// fetch one round trip per tree depth.
    pub fn descendants(&self, node: NodeRef) -> Many<NodeRef> {
        let eval = self.clone();
        self.nodes(ReadRequest::AllChildren(node))
            .flat_map(move |child| Many::of(vec![child]).concat(eval.descendants(child)))
    }

    /// The parent chain, nearest first, excluding `node`.
    pub fn ancestors(&self, node: NodeRef) -> Many<NodeRef> {
        let eval = self.clone();
        self.maybe_node(ReadRequest::Parent(node))
            .flat_map_many(move |parent| {
                Many::of(vec![parent]).concat(eval.ancestors(parent))
            })
    }

    fn all_references(&self, node: NodeRef) -> Many<NodeRef> {
        let eval = self.clone();
        self.roles(ReadRequest::ReferenceRoles(node))
            .flat_map(move |role| {
                eval.maybe_node(ReadRequest::ReferenceTarget(node, role))
                    .into_many()
            })
    }

    /// True when every filter passes for `node`.
    pub fn matches(&self, node: NodeRef, filters: &[Filter]) -> One<bool> {
        self.all_of(node, filters.to_vec().into_iter())
    }

    fn all_of(&self, node: NodeRef, mut rest: std::vec::IntoIter<Filter>) -> One<bool> {
        match rest.next() {
            None => One::of(true),
            Some(filter) => {
                let eval = self.clone();
                self.filter_passes(node, filter).flat_map_one(move |ok| {
                    if ok {
                        eval.all_of(node, rest)
                    } else {
                        One::of(false)
                    }
                })
            }
        }
    }

    fn any_of(&self, node: NodeRef, mut rest: std::vec::IntoIter<Filter>) -> One<bool> {
        match rest.next() {
            None => One::of(false),
            Some(filter) => {
                let eval = self.clone();
                self.filter_passes(node, filter).flat_map_one(move |ok| {
                    if ok {
                        One::of(true)
                    } else {
                        eval.any_of(node, rest)
                    }
                })
            }
        }
    }

    fn filter_passes(&self, node: NodeRef, filter: Filter) -> One<bool> {
        match filter {
            // A read failure inside a filter makes the filter fail for
            // this node; it does not abort the pass.
            Filter::Concept(concept) => self
                .concept_of(node)
                .map(move |found| found.as_ref() == Some(&concept))
                .on_error_return(false),
            Filter::ConceptName(name) => self
                .concept_of(node)
                .map(move |found| found.is_some_and(|c| c.short_name() == name))
                .on_error_return(false),
            Filter::Property { role, op, value } => self
                .property_of(node, role)
                .map(move |found| op.matches(found.as_deref(), &value))
                .on_error_return(false),
            Filter::And(filters) => self.all_of(node, filters.into_iter()),
            // An empty alternative list imposes no constraint.
            Filter::Or(filters) if filters.is_empty() => One::of(true),
            Filter::Or(filters) => self.any_of(node, filters.into_iter()),
            Filter::Not(inner) => self.filter_passes(node, *inner).map(|ok| !ok),
        }
    }
}

/// Evaluate a whole spec from scratch, without caching: every passing
/// result node in pre-order, parents before their subquery results,
/// roots in spec order.
pub fn evaluate_spec(
    executor: &ReadExecutor,
    spec: &QuerySpec,
    root: NodeRef,
) -> Result<Vec<NodeRef>, StreamError> {
    let spec = spec.clone();
    executor.collect(move |session| {
        let eval = Evaluator::new(session);
        let mut out = Many::empty();
        for sub in spec.roots() {
            out = out.concat(eval_subquery(&eval, root, sub.clone()));
        }
        out
    })
}

fn eval_subquery<S>(eval: &Evaluator<S>, source: NodeRef, sub: Subquery) -> Many<NodeRef>
where
    S: FetchSession<ReadRequest, ReadResponse> + Clone + 'static,
{
    let outer = eval.clone();
    eval.step(source, sub.step()).flat_map(move |node| {
        let inner = outer.clone();
        let sub = sub.clone();
        outer
            .matches(node, sub.filters())
            .flat_map_many(move |passing| {
                if !passing {
                    return Many::empty();
                }
                let mut out = Many::of(vec![node]);
                for child in sub.children() {
                    out = out.concat(eval_subquery(&inner, node, child.clone()));
                }
                out
            })
    })
}

/// The fetch a cache node performs for its own result set: recursive
/// steps fetch only the next frontier (the traversal continues node by
/// node inside the cache tree), the rest fetch their full result set.
pub(crate) fn immediate_step(step: &StepKind) -> StepKind {
    match step {
        StepKind::Descendants => StepKind::AllChildren,
        StepKind::Ancestors => StepKind::Parent,
        other => other.clone(),
    }
}

/// Whether a step expands node by node inside the cache tree.
pub(crate) fn is_recursive(step: &StepKind) -> bool {
    matches!(step, StepKind::Descendants | StepKind::Ancestors)
}

/// One cache node's pending recomputation, self-contained so a whole
/// batch of plans can run inside a single session: their reads advance
/// together and coalesce into shared round trips.
#[derive(Clone)]
pub(crate) enum RecomputePlan {
    /// Re-fetch a node's immediate result set.
    Step {
        /// Node the step is evaluated from.
        source: NodeRef,
        /// The immediate step (recursive steps already mapped to their
        /// frontier fetch).
        step: StepKind,
        /// Receives the identities read by this plan.
        log: ReadLog,
    },
    /// Re-apply a result's filters and, for recursive steps, re-fetch
    /// its frontier.
    Result {
        /// The result node.
        node: NodeRef,
        /// Filters to re-apply.
        filters: Vec<Filter>,
        /// Frontier fetch for recursive steps.
        frontier_step: Option<StepKind>,
        /// Receives the identities read by this plan.
        log: ReadLog,
    },
}

/// What a [`RecomputePlan`] computed.
pub(crate) enum RecomputeOutcome {
    /// The step's produced result set.
    Produced(Vec<NodeRef>),
    /// The filter outcome and, for recursive steps, the frontier.
    Filtered {
        passing: bool,
        frontier: Option<Vec<NodeRef>>,
    },
}

impl RecomputePlan {
    fn build(self, session: ReadSession) -> One<RecomputeOutcome> {
        match self {
            RecomputePlan::Step { source, step, log } => {
                Evaluator::new(RecordingSession::new(session, log))
                    .step(source, &step)
                    .collected()
                    .map(RecomputeOutcome::Produced)
            }
            RecomputePlan::Result {
                node,
                filters,
                frontier_step,
                log,
            } => {
                let eval = Evaluator::new(RecordingSession::new(session, log));
                let passing = eval.matches(node, &filters);
                let frontier = match frontier_step {
                    Some(step) => eval.step(node, &step).collected().map(Some),
                    None => One::of(None),
                };
                passing
                    .zip(frontier)
                    .map(|(passing, frontier)| RecomputeOutcome::Filtered { passing, frontier })
            }
        }
    }
}

/// Run a batch of recomputations in one session. Outcomes align with
/// the plans; each plan's log holds the identities it read.
pub(crate) fn run_plans(
    executor: &ReadExecutor,
    plans: Vec<RecomputePlan>,
) -> Result<Vec<RecomputeOutcome>, StreamError> {
    executor.collect(move |session| {
        Many::collect(
            plans
                .into_iter()
                .map(|plan| plan.build(session.clone()))
                .collect::<Vec<_>>(),
        )
    })
}
