//! Multiplicity-typed, lazily evaluated stream expressions.
//!
//! A stream expression is an inert description of a computation that
//! yields zero, one, or many values. Building one performs no reads;
//! running one requires an executor from [`bulk`](crate::bulk): the
//! direct executor resolves every point read immediately, the bulk
//! executor coalesces reads issued in the same round into batches, and
//! the async executor does the same while awaiting the injected fetch
//! function. All executors observe the same element order and raise the
//! same error kinds.
//!
//! The multiplicity of an expression is part of its type:
//!
//! - [`Zero`] — no values, effects only
//! - [`One`] — exactly one value
//! - [`ZeroOrOne`] — an optional value
//! - [`Many`] — any number of values, in order
//! - [`OneOrMany`] — at least one value
//!
//! Combinators compose multiplicities: filtering a [`One`] yields a
//! [`ZeroOrOne`], flat-mapping a [`One`] into a [`Many`] yields a
//! [`Many`], and the `exactly_one` / `at_most_one` / `assert_not_empty`
//! assertions narrow multiplicity, failing fast with a named
//! [`StreamError`] instead of silently truncating.

use std::hash::Hash;

use crate::error::StreamError;

type Thunk<T> = Box<dyn FnOnce() -> Fetch<T>>;

/// The evaluation state of a deferred computation.
///
/// `Lazy` steps always make progress when forced; `Blocked` steps wait on
/// a pending batch slot and only make progress after the owning session
/// drains a batch. Combinators keep stepping `Lazy` sides before
/// declaring a combination `Blocked`, so every read reachable without a
/// round trip is enqueued before the next batch is dispatched.
pub(crate) enum Fetch<T> {
    Done(T),
    Fail(StreamError),
    Lazy(Thunk<T>),
    Blocked(Thunk<T>),
}

impl<T: 'static> Fetch<T> {
    pub(crate) fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Fetch<U> {
        self.and_then(move |value| Fetch::Done(f(value)))
    }

    pub(crate) fn and_then<U: 'static>(
        self,
        f: impl FnOnce(T) -> Fetch<U> + 'static,
    ) -> Fetch<U> {
        match self {
            Fetch::Done(value) => f(value),
            Fetch::Fail(err) => Fetch::Fail(err),
            Fetch::Lazy(thunk) => Fetch::Lazy(Box::new(move || thunk().and_then(f))),
            Fetch::Blocked(thunk) => Fetch::Blocked(Box::new(move || thunk().and_then(f))),
        }
    }

    pub(crate) fn recover(self, f: impl FnOnce(StreamError) -> Fetch<T> + 'static) -> Fetch<T> {
        match self {
            Fetch::Done(value) => Fetch::Done(value),
            Fetch::Fail(err) => f(err),
            Fetch::Lazy(thunk) => Fetch::Lazy(Box::new(move || thunk().recover(f))),
            Fetch::Blocked(thunk) => Fetch::Blocked(Box::new(move || thunk().recover(f))),
        }
    }

    /// Combine two computations, advancing both. Unlike `and_then`, the
    /// right side does not wait for the left to finish, so reads on both
    /// sides land in the same batch.
    pub(crate) fn zip<U: 'static>(self, other: Fetch<U>) -> Fetch<(T, U)> {
        match (self, other) {
            (Fetch::Fail(err), _) => Fetch::Fail(err),
            (_, Fetch::Fail(err)) => Fetch::Fail(err),
            (Fetch::Done(a), Fetch::Done(b)) => Fetch::Done((a, b)),
            (Fetch::Lazy(ta), b) => Fetch::Lazy(Box::new(move || ta().zip(b))),
            (a, Fetch::Lazy(tb)) => Fetch::Lazy(Box::new(move || a.zip(tb()))),
            (Fetch::Blocked(ta), b) => Fetch::Blocked(Box::new(move || ta().zip(b))),
            (a, Fetch::Blocked(tb)) => Fetch::Blocked(Box::new(move || a.zip(tb()))),
        }
    }

    /// Combine any number of computations, preserving their order.
    pub(crate) fn join_all(parts: Vec<Fetch<T>>) -> Fetch<Vec<T>> {
        let mut joined = Fetch::Done(Vec::with_capacity(parts.len()));
        for part in parts {
            joined = joined.zip(part).map(|(mut values, value)| {
                values.push(value);
                values
            });
        }
        joined
    }
}

/// Run a computation to completion, calling `drain` whenever it blocks on
/// a pending batch. `drain` returns whether it made progress; blocking
/// with no way to progress means the value belongs to another session.
pub(crate) fn drive<T: 'static>(
    mut fetch: Fetch<T>,
    mut drain: impl FnMut() -> Result<bool, StreamError>,
) -> Result<T, StreamError> {
    loop {
        match fetch {
            Fetch::Done(value) => return Ok(value),
            Fetch::Fail(err) => return Err(err),
            Fetch::Lazy(thunk) => fetch = thunk(),
            Fetch::Blocked(thunk) => {
                if !drain()? {
                    return Err(StreamError::Detached);
                }
                fetch = thunk();
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn run_pure<T: 'static>(fetch: Fetch<T>) -> Result<T, StreamError> {
    drive(fetch, || Ok(false))
}

// ============================================================================
// Zero
// ============================================================================

/// A computation with no values, run for its effects.
pub struct Zero {
    fetch: Fetch<()>,
}

impl Zero {
    /// A completed, empty computation.
    pub fn done() -> Self {
        Zero {
            fetch: Fetch::Done(()),
        }
    }

    /// Sequence another computation after this one.
    pub fn then_one<T: 'static>(self, next: One<T>) -> One<T> {
        One {
            fetch: self.fetch.and_then(move |()| next.fetch),
        }
    }

    /// Sequence a many-valued computation after this one.
    pub fn then_many<T: 'static>(self, next: Many<T>) -> Many<T> {
        Many {
            fetch: self.fetch.and_then(move |()| next.fetch),
        }
    }
}

// ============================================================================
// One
// ============================================================================

/// A computation yielding exactly one value.
pub struct One<T> {
    fetch: Fetch<T>,
}

impl<T: 'static> One<T> {
    /// Lift a plain value.
    pub fn of(value: T) -> Self {
        One {
            fetch: Fetch::Done(value),
        }
    }

    /// A computation that fails when run.
    pub fn failed(err: StreamError) -> Self {
        One {
            fetch: Fetch::Fail(err),
        }
    }

    /// Transform the value.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> One<U> {
        One {
            fetch: self.fetch.map(f),
        }
    }

    /// Keep the value only if the predicate holds.
    pub fn filter(self, pred: impl FnOnce(&T) -> bool + 'static) -> ZeroOrOne<T> {
        ZeroOrOne {
            fetch: self
                .fetch
                .map(move |value| if pred(&value) { Some(value) } else { None }),
        }
    }

    /// Chain into another single-valued computation.
    pub fn flat_map_one<U: 'static>(self, f: impl FnOnce(T) -> One<U> + 'static) -> One<U> {
        One {
            fetch: self.fetch.and_then(move |value| f(value).fetch),
        }
    }

    /// Chain into an optional computation.
    pub fn flat_map_optional<U: 'static>(
        self,
        f: impl FnOnce(T) -> ZeroOrOne<U> + 'static,
    ) -> ZeroOrOne<U> {
        ZeroOrOne {
            fetch: self.fetch.and_then(move |value| f(value).fetch),
        }
    }

    /// Chain into a many-valued computation.
    pub fn flat_map_many<U: 'static>(self, f: impl FnOnce(T) -> Many<U> + 'static) -> Many<U> {
        Many {
            fetch: self.fetch.and_then(move |value| f(value).fetch),
        }
    }

    /// Pair with another computation, advancing both together.
    pub fn zip<U: 'static>(self, other: One<U>) -> One<(T, U)> {
        One {
            fetch: self.fetch.zip(other.fetch),
        }
    }

    /// Substitute a value for any error.
    pub fn on_error_return(self, value: T) -> One<T> {
        One {
            fetch: self.fetch.recover(move |_| Fetch::Done(value)),
        }
    }

    /// Widen to an optional computation.
    pub fn into_zero_or_one(self) -> ZeroOrOne<T> {
        ZeroOrOne {
            fetch: self.fetch.map(Some),
        }
    }

    /// Widen to a many-valued computation.
    pub fn into_many(self) -> Many<T> {
        Many {
            fetch: self.fetch.map(|value| vec![value]),
        }
    }

    /// Discard the value, keeping only the effects.
    pub fn into_zero(self) -> Zero {
        Zero {
            fetch: self.fetch.map(|_| ()),
        }
    }

    pub(crate) fn into_fetch(self) -> Fetch<T> {
        self.fetch
    }
}

impl<T: 'static> One<Vec<T>> {
    /// Flatten a single vector value into its elements.
    pub fn flatten_many(self) -> Many<T> {
        Many { fetch: self.fetch }
    }
}

// ============================================================================
// ZeroOrOne
// ============================================================================

/// A computation yielding zero or one value.
pub struct ZeroOrOne<T> {
    fetch: Fetch<Option<T>>,
}

impl<T: 'static> ZeroOrOne<T> {
    /// Lift an optional value.
    pub fn of(value: Option<T>) -> Self {
        ZeroOrOne {
            fetch: Fetch::Done(value),
        }
    }

    /// A present value.
    pub fn some(value: T) -> Self {
        Self::of(Some(value))
    }

    /// An absent value.
    pub fn none() -> Self {
        Self::of(None)
    }

    /// Transform the value if present.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> ZeroOrOne<U> {
        ZeroOrOne {
            fetch: self.fetch.map(move |value| value.map(f)),
        }
    }

    /// Keep the value only if the predicate holds.
    pub fn filter(self, pred: impl FnOnce(&T) -> bool + 'static) -> ZeroOrOne<T> {
        ZeroOrOne {
            fetch: self.fetch.map(move |value| value.filter(|v| pred(v))),
        }
    }

    /// Chain into another optional computation; absence short-circuits.
    pub fn flat_map<U: 'static>(
        self,
        f: impl FnOnce(T) -> ZeroOrOne<U> + 'static,
    ) -> ZeroOrOne<U> {
        ZeroOrOne {
            fetch: self.fetch.and_then(move |value| match value {
                Some(v) => f(v).fetch,
                None => Fetch::Done(None),
            }),
        }
    }

    /// Chain into a many-valued computation; absence yields no elements.
    pub fn flat_map_many<U: 'static>(
        self,
        f: impl FnOnce(T) -> Many<U> + 'static,
    ) -> Many<U> {
        Many {
            fetch: self.fetch.and_then(move |value| match value {
                Some(v) => f(v).fetch,
                None => Fetch::Done(Vec::new()),
            }),
        }
    }

    /// Substitute a default for absence.
    pub fn or_value(self, default: T) -> One<T> {
        One {
            fetch: self.fetch.map(move |value| value.unwrap_or(default)),
        }
    }

    /// Assert presence, failing with a named error otherwise.
    pub fn assert_some(self, context: impl Into<String>) -> One<T> {
        let context = context.into();
        One {
            fetch: self.fetch.and_then(move |value| match value {
                Some(v) => Fetch::Done(v),
                None => Fetch::Fail(StreamError::ExpectedOne { context }),
            }),
        }
    }

    /// Substitute a value for any error.
    pub fn on_error_return(self, value: Option<T>) -> ZeroOrOne<T> {
        ZeroOrOne {
            fetch: self.fetch.recover(move |_| Fetch::Done(value)),
        }
    }

    /// Widen to a many-valued computation.
    pub fn into_many(self) -> Many<T> {
        Many {
            fetch: self.fetch.map(|value| value.into_iter().collect()),
        }
    }

    pub(crate) fn from_fetch(fetch: Fetch<Option<T>>) -> Self {
        ZeroOrOne { fetch }
    }

    pub(crate) fn into_fetch(self) -> Fetch<Option<T>> {
        self.fetch
    }
}

// ============================================================================
// Many
// ============================================================================

/// A computation yielding any number of values, in a defined order.
pub struct Many<T> {
    fetch: Fetch<Vec<T>>,
}

impl<T: 'static> Many<T> {
    /// Lift a vector of values.
    pub fn of(values: Vec<T>) -> Self {
        Many {
            fetch: Fetch::Done(values),
        }
    }

    /// No values.
    pub fn empty() -> Self {
        Self::of(Vec::new())
    }

    /// Gather single-valued computations, preserving their order. All of
    /// them advance together, so their reads coalesce into shared
    /// batches.
    pub fn collect(parts: impl IntoIterator<Item = One<T>>) -> Self {
        Many {
            fetch: Fetch::join_all(parts.into_iter().map(One::into_fetch).collect()),
        }
    }

    /// Gather optional computations, dropping absences and preserving the
    /// order of the rest.
    pub fn collect_optional(parts: impl IntoIterator<Item = ZeroOrOne<T>>) -> Self {
        let joined = Fetch::join_all(parts.into_iter().map(ZeroOrOne::into_fetch).collect());
        Many {
            fetch: joined.map(|values| values.into_iter().flatten().collect()),
        }
    }

    /// Transform every element.
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + 'static) -> Many<U> {
        Many {
            fetch: self.fetch.map(move |values| values.into_iter().map(f).collect()),
        }
    }

    /// Keep only elements matching the predicate.
    pub fn filter(self, pred: impl Fn(&T) -> bool + 'static) -> Many<T> {
        Many {
            fetch: self
                .fetch
                .map(move |values| values.into_iter().filter(|v| pred(v)).collect()),
        }
    }

    /// Chain every element into another many-valued computation. Element
    /// order follows the source order; the per-element computations
    /// advance together so their reads coalesce.
    pub fn flat_map<U: 'static>(self, f: impl Fn(T) -> Many<U> + 'static) -> Many<U> {
        Many {
            fetch: self.fetch.and_then(move |values| {
                let parts = values.into_iter().map(|v| f(v).fetch).collect();
                Fetch::join_all(parts).map(|nested: Vec<Vec<U>>| {
                    nested.into_iter().flatten().collect()
                })
            }),
        }
    }

    /// Append another computation's values after this one's.
    pub fn concat(self, other: Many<T>) -> Many<T> {
        Many {
            fetch: self.fetch.zip(other.fetch).map(|(mut left, right)| {
                left.extend(right);
                left
            }),
        }
    }

    /// Reduce the values left to right.
    pub fn fold<B: 'static>(self, init: B, f: impl Fn(B, T) -> B + 'static) -> One<B> {
        One {
            fetch: self
                .fetch
                .map(move |values| values.into_iter().fold(init, &f)),
        }
    }

    /// Count the values.
    pub fn count(self) -> One<usize> {
        One {
            fetch: self.fetch.map(|values| values.len()),
        }
    }

    /// Keep the first occurrence of each value.
    pub fn distinct(self) -> Many<T>
    where
        T: Eq + Hash + Clone,
    {
        Many {
            fetch: self.fetch.map(|values| {
                let mut seen = ahash::HashSet::default();
                values
                    .into_iter()
                    .filter(|value| seen.insert(value.clone()))
                    .collect()
            }),
        }
    }

    /// Keep at most the first `n` values.
    pub fn take(self, n: usize) -> Many<T> {
        Many {
            fetch: self.fetch.map(move |mut values| {
                values.truncate(n);
                values
            }),
        }
    }

    /// The first value, if any.
    pub fn first(self) -> ZeroOrOne<T> {
        ZeroOrOne {
            fetch: self.fetch.map(|values| values.into_iter().next()),
        }
    }

    /// The first value, or a default when empty.
    pub fn first_or(self, default: T) -> One<T> {
        self.first().or_value(default)
    }

    /// Assert exactly one value, failing with a named error otherwise.
    pub fn exactly_one(self, context: impl Into<String>) -> One<T> {
        let context = context.into();
        One {
            fetch: self.fetch.and_then(move |mut values| {
                match (values.pop(), values.len()) {
                    (Some(last), 0) => Fetch::Done(last),
                    (None, _) => Fetch::Fail(StreamError::ExpectedOne { context }),
                    (Some(_), rest) => Fetch::Fail(StreamError::TooMany {
                        found: rest + 1,
                        context,
                    }),
                }
            }),
        }
    }

    /// Assert at most one value.
    pub fn at_most_one(self, context: impl Into<String>) -> ZeroOrOne<T> {
        let context = context.into();
        ZeroOrOne {
            fetch: self.fetch.and_then(move |mut values| {
                match (values.pop(), values.len()) {
                    (Some(last), 0) => Fetch::Done(Some(last)),
                    (None, _) => Fetch::Done(None),
                    (Some(_), rest) => Fetch::Fail(StreamError::TooMany {
                        found: rest + 1,
                        context,
                    }),
                }
            }),
        }
    }

    /// Assert at least one value.
    pub fn assert_not_empty(self, context: impl Into<String>) -> OneOrMany<T> {
        let context = context.into();
        OneOrMany {
            fetch: self.fetch.and_then(move |values| {
                if values.is_empty() {
                    Fetch::Fail(StreamError::ExpectedNonEmpty { context })
                } else {
                    Fetch::Done(values)
                }
            }),
        }
    }

    /// Substitute values for any error.
    pub fn on_error_return(self, values: Vec<T>) -> Many<T> {
        Many {
            fetch: self.fetch.recover(move |_| Fetch::Done(values)),
        }
    }

    /// Gather the values into one vector-valued result.
    pub fn collected(self) -> One<Vec<T>> {
        One { fetch: self.fetch }
    }

    /// Discard the values, keeping only the effects.
    pub fn into_zero(self) -> Zero {
        Zero {
            fetch: self.fetch.map(|_| ()),
        }
    }

    pub(crate) fn into_fetch(self) -> Fetch<Vec<T>> {
        self.fetch
    }
}

// ============================================================================
// OneOrMany
// ============================================================================

/// A computation yielding at least one value.
pub struct OneOrMany<T> {
    fetch: Fetch<Vec<T>>,
}

impl<T: 'static> OneOrMany<T> {
    /// Lift a head value and a possibly empty tail.
    pub fn of(first: T, mut rest: Vec<T>) -> Self {
        rest.insert(0, first);
        OneOrMany {
            fetch: Fetch::Done(rest),
        }
    }

    /// Transform every element.
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + 'static) -> OneOrMany<U> {
        OneOrMany {
            fetch: self.fetch.map(move |values| values.into_iter().map(f).collect()),
        }
    }

    /// Chain every element; non-emptiness is preserved because each
    /// element yields at least one value.
    pub fn flat_map<U: 'static>(
        self,
        f: impl Fn(T) -> OneOrMany<U> + 'static,
    ) -> OneOrMany<U> {
        OneOrMany {
            fetch: self.fetch.and_then(move |values| {
                let parts = values.into_iter().map(|v| f(v).fetch).collect();
                Fetch::join_all(parts).map(|nested: Vec<Vec<U>>| {
                    nested.into_iter().flatten().collect()
                })
            }),
        }
    }

    /// Filtering may drop every element, so the result widens.
    pub fn filter(self, pred: impl Fn(&T) -> bool + 'static) -> Many<T> {
        self.into_many().filter(pred)
    }

    /// Append more values.
    pub fn concat(self, other: Many<T>) -> OneOrMany<T> {
        OneOrMany {
            fetch: self.fetch.zip(other.into_fetch()).map(|(mut left, right)| {
                left.extend(right);
                left
            }),
        }
    }

    /// Reduce the values left to right.
    pub fn fold<B: 'static>(self, init: B, f: impl Fn(B, T) -> B + 'static) -> One<B> {
        self.into_many().fold(init, f)
    }

    /// Count the values (always at least one).
    pub fn count(self) -> One<usize> {
        self.into_many().count()
    }

    /// The first value.
    pub fn first(self) -> One<T> {
        One {
            fetch: self.fetch.and_then(|values| match values.into_iter().next() {
                Some(first) => Fetch::Done(first),
                None => Fetch::Fail(StreamError::ExpectedNonEmpty {
                    context: "first of a non-empty stream".into(),
                }),
            }),
        }
    }

    /// Widen to an unconstrained stream.
    pub fn into_many(self) -> Many<T> {
        Many { fetch: self.fetch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<T: 'static>(many: Many<T>) -> Vec<T> {
        run_pure(many.into_fetch()).expect("pure stream")
    }

    #[test]
    fn map_identity_is_identity() {
        let mapped = values(Many::of(vec![1, 2, 3]).map(|x| x));
        assert_eq!(mapped, vec![1, 2, 3]);
    }

    #[test]
    fn flat_map_is_associative() {
        let f = |x: i32| Many::of(vec![x, x + 10]);
        let g = |x: i32| Many::of(vec![x * 2]);
        let left = values(Many::of(vec![1, 2]).flat_map(f).flat_map(g));
        let right = values(Many::of(vec![1, 2]).flat_map(move |x| f(x).flat_map(g)));
        assert_eq!(left, right);
        assert_eq!(left, vec![2, 22, 4, 24]);
    }

    #[test]
    fn concat_preserves_order() {
        let out = values(Many::of(vec![1, 2]).concat(Many::of(vec![3])).concat(Many::empty()));
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn filter_on_one_widens() {
        let kept = One::of(5).filter(|v| *v > 0);
        assert_eq!(run_pure(kept.into_fetch()).unwrap(), Some(5));
        let dropped = One::of(-5).filter(|v| *v > 0);
        assert_eq!(run_pure(dropped.into_fetch()).unwrap(), None);
    }

    #[test]
    fn exactly_one_names_the_failure() {
        let err = run_pure(Many::<i32>::empty().exactly_one("lookup").into_fetch())
            .expect_err("empty stream");
        assert!(matches!(err, StreamError::ExpectedOne { .. }));

        let err = run_pure(Many::of(vec![1, 2]).exactly_one("lookup").into_fetch())
            .expect_err("two elements");
        assert!(matches!(err, StreamError::TooMany { found: 2, .. }));

        let ok = run_pure(Many::of(vec![7]).exactly_one("lookup").into_fetch()).unwrap();
        assert_eq!(ok, 7);
    }

    #[test]
    fn assert_not_empty_and_first() {
        let head = Many::of(vec![4, 5]).assert_not_empty("frontier").first();
        assert_eq!(run_pure(head.into_fetch()).unwrap(), 4);

        let err = run_pure(
            Many::<i32>::empty()
                .assert_not_empty("frontier")
                .first()
                .into_fetch(),
        )
        .expect_err("empty stream");
        assert!(matches!(err, StreamError::ExpectedNonEmpty { .. }));
    }

    #[test]
    fn distinct_take_fold_count() {
        assert_eq!(values(Many::of(vec![1, 2, 1, 3, 2]).distinct()), vec![1, 2, 3]);
        assert_eq!(values(Many::of(vec![1, 2, 3]).take(2)), vec![1, 2]);
        let sum = Many::of(vec![1, 2, 3]).fold(0, |acc, x| acc + x);
        assert_eq!(run_pure(sum.into_fetch()).unwrap(), 6);
        let n = Many::of(vec![1, 2, 3]).count();
        assert_eq!(run_pure(n.into_fetch()).unwrap(), 3);
    }

    #[test]
    fn on_error_return_substitutes() {
        let recovered = One::<i32>::failed(StreamError::Detached).on_error_return(9);
        assert_eq!(run_pure(recovered.into_fetch()).unwrap(), 9);

        let untouched = One::of(1).on_error_return(9);
        assert_eq!(run_pure(untouched.into_fetch()).unwrap(), 1);
    }

    #[test]
    fn zero_sequences_effects() {
        let out = Zero::done().then_one(One::of(3)).map(|x| x + 1);
        assert_eq!(run_pure(out.into_fetch()).unwrap(), 4);
    }

    #[test]
    fn collect_preserves_order_and_drops_absent() {
        let gathered = Many::collect([One::of(1), One::of(2), One::of(3)]);
        assert_eq!(values(gathered), vec![1, 2, 3]);

        let gathered = Many::collect_optional([
            ZeroOrOne::some(1),
            ZeroOrOne::none(),
            ZeroOrOne::some(3),
        ]);
        assert_eq!(values(gathered), vec![1, 3]);
    }
}
