//! The immutable query model.
//!
//! A [`QuerySpec`] describes what to fetch: a set of root queries, each a
//! traversal step with optional filters and nested subqueries. Specs are
//! plain data — building one performs no reads — and the engine compares
//! them by equality to decide when its cache tree must be rebuilt.

use crate::model::{ConceptId, RoleId};

/// One traversal step of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// All children across all roles.
    AllChildren,
    /// Children of one role, in model order. Unknown roles yield nothing.
    ChildrenOfRole(RoleId),
    /// All transitive children in pre-order, excluding the source node.
    Descendants,
    /// The chain of containing parents, nearest first, excluding the
    /// source node.
    Ancestors,
    /// The containing parent (zero or one result).
    Parent,
    /// The target of one reference role (zero or one result; unresolved
    /// roles yield nothing).
    ReferenceOfRole(RoleId),
    /// One target per populated reference role.
    AllReferences,
    /// Resolve a serialized identity against the source node's scope
    /// (zero or one result).
    ById(String),
    /// The source node itself.
    RootNode,
}

/// Comparison operator for property filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyOp {
    /// Property is set and equal to the operand.
    Equals,
    /// Property is absent or differs from the operand.
    NotEquals,
    /// Property is set and contains the operand.
    Contains,
    /// Property is set and starts with the operand.
    StartsWith,
    /// Property is set and ends with the operand.
    EndsWith,
    /// Property is set at all; the operand is ignored.
    IsSet,
}

impl PropertyOp {
    /// Apply the operator to a property value.
    pub fn matches(self, value: Option<&str>, operand: &str) -> bool {
        match (self, value) {
            (PropertyOp::Equals, Some(v)) => v == operand,
            (PropertyOp::NotEquals, Some(v)) => v != operand,
            (PropertyOp::NotEquals, None) => true,
            (PropertyOp::Contains, Some(v)) => v.contains(operand),
            (PropertyOp::StartsWith, Some(v)) => v.starts_with(operand),
            (PropertyOp::EndsWith, Some(v)) => v.ends_with(operand),
            (PropertyOp::IsSet, Some(_)) => true,
            (_, None) => false,
        }
    }
}

/// A boolean condition on a result node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    /// The node's concept token equals the given token.
    Concept(ConceptId),
    /// The final dot-separated segment of the node's concept token equals
    /// the given name.
    ConceptName(String),
    /// A property comparison.
    Property {
        /// Property role to read.
        role: RoleId,
        /// Operator to apply.
        op: PropertyOp,
        /// Right-hand operand.
        value: String,
    },
    /// All conditions hold (vacuously true when empty).
    And(Vec<Filter>),
    /// Any condition holds; an empty list imposes no constraint and is
    /// therefore true.
    Or(Vec<Filter>),
    /// The condition does not hold.
    Not(Box<Filter>),
}

impl Filter {
    /// Property-equals shorthand.
    pub fn property_equals(role: impl Into<RoleId>, value: impl Into<String>) -> Self {
        Filter::Property {
            role: role.into(),
            op: PropertyOp::Equals,
            value: value.into(),
        }
    }

    /// Concept shorthand.
    pub fn concept(id: impl Into<ConceptId>) -> Self {
        Filter::Concept(id.into())
    }
}

/// One query node: a step, the filters applied to its results, and the
/// subqueries evaluated from each passing result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subquery {
    step: StepKind,
    filters: Vec<Filter>,
    children: Vec<Subquery>,
}

impl Subquery {
    /// A subquery with no filters and no nested subqueries.
    pub fn new(step: StepKind) -> Self {
        Subquery {
            step,
            filters: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Add a filter. Multiple filters must all pass.
    pub fn filtered(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a nested subquery evaluated from each passing result.
    pub fn with_child(mut self, child: Subquery) -> Self {
        self.children.push(child);
        self
    }

    /// The traversal step.
    pub fn step(&self) -> &StepKind {
        &self.step
    }

    /// The filters, all of which must pass.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// The nested subqueries.
    pub fn children(&self) -> &[Subquery] {
        &self.children
    }
}

/// An immutable set of root queries.
///
/// # Examples
///
/// ```
/// # use treeql::{Filter, QuerySpec, StepKind, Subquery};
/// let spec = QuerySpec::new(vec![Subquery::new(StepKind::Descendants)
///     .filtered(Filter::ConceptName("Folder".into()))]);
/// assert_eq!(spec.roots().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QuerySpec {
    roots: Vec<Subquery>,
}

impl QuerySpec {
    /// Create a spec from its root queries.
    pub fn new(roots: Vec<Subquery>) -> Self {
        QuerySpec { roots }
    }

    /// A spec with a single root query.
    pub fn single(root: Subquery) -> Self {
        QuerySpec { roots: vec![root] }
    }

    /// The root queries.
    pub fn roots(&self) -> &[Subquery] {
        &self.roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_op_semantics() {
        assert!(PropertyOp::Equals.matches(Some("a"), "a"));
        assert!(!PropertyOp::Equals.matches(None, "a"));
        assert!(PropertyOp::NotEquals.matches(None, "a"));
        assert!(PropertyOp::Contains.matches(Some("abc"), "b"));
        assert!(PropertyOp::StartsWith.matches(Some("abc"), "ab"));
        assert!(PropertyOp::EndsWith.matches(Some("abc"), "bc"));
        assert!(PropertyOp::IsSet.matches(Some(""), "ignored"));
        assert!(!PropertyOp::IsSet.matches(None, "ignored"));
    }

    #[test]
    fn specs_compare_by_structure() {
        let a = QuerySpec::single(Subquery::new(StepKind::AllChildren));
        let b = QuerySpec::single(Subquery::new(StepKind::AllChildren));
        let c = QuerySpec::single(Subquery::new(StepKind::Descendants));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
