//! Incremental query caching and bulk-batched evaluation over shared
//! model trees.
//!
//! Many independent consumers (editors, UIs, servers) query the same
//! mutable tree of typed nodes through a small declarative language:
//! select children, descendants, references or ancestors, filter by
//! concept or property, nest subqueries. Recomputing every result from
//! scratch on every edit is too expensive. This crate keeps a cache tree
//! mirroring each query's shape, invalidates exactly the portions whose
//! underlying data changed, and coalesces the many small point reads of
//! revalidation into batched round trips.
//!
//! # Key pieces
//!
//! - [`QuerySpec`] — an immutable description of what to fetch
//! - [`QueryEngine`] — validates a query against a root node, reports
//!   the current result set, and applies change notifications precisely
//! - [`ModelReader`] — the narrow interface the external model provides
//! - [`One`] / [`ZeroOrOne`] / [`Many`] / [`OneOrMany`] / [`Zero`] —
//!   multiplicity-typed stream expressions; inert until run
//! - [`DirectExecutor`] / [`BulkExecutor`] / [`AsyncBulkExecutor`] —
//!   interchangeable execution backends; the bulk ones coalesce the
//!   point reads of one session into `execute(keys)` batches
//!
//! # Example
//!
//! ```
//! use treeql::{Filter, MemoryModel, QueryEngine, QuerySpec, StepKind, Subquery};
//!
//! let model = MemoryModel::new();
//! let root = model.add_root("fs.Root");
//! let docs = model.add_child(root, "items", "fs.Folder");
//! let readme = model.add_child(docs, "items", "fs.File");
//!
//! // Every descendant folder of the root.
//! let spec = QuerySpec::single(
//!     Subquery::new(StepKind::Descendants).filtered(Filter::ConceptName("Folder".into())),
//! );
//!
//! let mut engine = QueryEngine::direct(model.clone());
//! let mut found = Vec::new();
//! engine.validate(&spec, root, |node| found.push(node))?;
//! assert_eq!(found, vec![docs]);
//!
//! // Edits are reported per node; revalidation walks only dirty paths.
//! model.set_concept(readme, "fs.Folder");
//! engine.invalidate(model.changes().drain());
//! let mut found = Vec::new();
//! engine.validate(&spec, root, |node| found.push(node))?;
//! assert_eq!(found, vec![docs, readme]);
//! # Ok::<(), treeql::StreamError>(())
//! ```

#![warn(missing_docs)]

mod bulk;
mod cache;
mod engine;
mod error;
mod eval;
mod index;
mod memory;
mod model;
mod query;
mod stream;

pub use bulk::{
    AsyncBatchFetch, AsyncBulkExecutor, BatchFetch, BulkExecutor, BulkSession, DirectExecutor,
    DirectSession, DrainOrder, FetchSession, DEFAULT_BATCH_SIZE,
};
pub use engine::QueryEngine;
pub use error::{ModelReadError, StreamError};
pub use eval::{
    evaluate_spec, Evaluator, ModelFetch, ReadExecutor, ReadRequest, ReadResponse, ReadSession,
};
pub use memory::MemoryModel;
pub use model::{ChangeBuffer, ConceptId, ModelReader, NodeRef, RoleId};
pub use query::{Filter, PropertyOp, QuerySpec, StepKind, Subquery};
pub use stream::{Many, One, OneOrMany, Zero, ZeroOrOne};
