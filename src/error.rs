//! Error types for model reads and stream evaluation.

use std::sync::Arc;

use thiserror::Error;

use crate::model::{NodeRef, RoleId};

/// Errors reported by a [`ModelReader`](crate::ModelReader) implementation.
///
/// Not-found conditions (`UnknownNode`, `UnknownRole`, `UnresolvedId`) are
/// recoverable: the evaluator treats them as empty results rather than
/// failures. `Backend` signals a real failure of the underlying store and
/// aborts the read that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelReadError {
    /// The node identity is not (or no longer) present in the model.
    #[error("unknown node {0}")]
    UnknownNode(NodeRef),

    /// The role is not declared or not populated on the node.
    #[error("unknown role `{role}` on {node}")]
    UnknownRole {
        /// Node the lookup was issued against.
        node: NodeRef,
        /// Role that could not be resolved.
        role: RoleId,
    },

    /// A serialized node id could not be resolved in the given scope.
    #[error("unresolved id `{0}`")]
    UnresolvedId(String),

    /// The underlying store failed.
    #[error("model backend error: {0}")]
    Backend(String),
}

impl ModelReadError {
    /// Returns true for conditions the evaluator maps to empty results.
    pub fn is_not_found(&self) -> bool {
        !matches!(self, ModelReadError::Backend(_))
    }
}

/// Errors surfaced when running a stream expression.
///
/// Multiplicity violations name the assertion that failed; batch failures
/// carry the injected fetch function's error, shared by every placeholder
/// of the failed batch (and no others).
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// `exactly_one` (or `assert_some`) observed zero elements.
    #[error("expected exactly one element, found none ({context})")]
    ExpectedOne {
        /// Short description of the expression that failed.
        context: String,
    },

    /// `exactly_one` / `at_most_one` observed more than one element.
    #[error("expected at most one element, found {found} ({context})")]
    TooMany {
        /// Number of elements actually produced.
        found: usize,
        /// Short description of the expression that failed.
        context: String,
    },

    /// `assert_not_empty` observed zero elements.
    #[error("expected at least one element ({context})")]
    ExpectedNonEmpty {
        /// Short description of the expression that failed.
        context: String,
    },

    /// The injected batch fetch function failed for the batch this
    /// placeholder was part of.
    #[error("batch fetch failed: {0}")]
    Batch(Arc<anyhow::Error>),

    /// A placeholder was driven without an open batching session that
    /// could resolve it (for example, a value leaked out of `query` and
    /// was run against a different executor).
    #[error("stream placeholder is not resolvable in this session")]
    Detached,
}

impl StreamError {
    pub(crate) fn batch(err: anyhow::Error) -> Self {
        StreamError::Batch(Arc::new(err))
    }
}
