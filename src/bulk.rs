//! Batching executors for stream expressions.
//!
//! A session is opened by a single top-level [`BulkExecutor::query`] /
//! [`BulkExecutor::iterate`] call. While it is open, every
//! [`FetchSession::enqueue`] records a pending slot — deduplicated by key
//! within the session — and returns a placeholder stream that resolves
//! once the slot's batch has executed. Draining passes at most
//! `batch_size` keys to the injected fetch function per call, newest
//! enqueued first by default: dependent reads tend to move toward the
//! leaves of the data graph, so draining the newest requests first keeps
//! the queue's peak size bounded.
//!
//! Three executors share the same session machinery:
//!
//! - [`DirectExecutor`] answers every enqueue immediately (batches of
//!   one, no suspension points) — the right backend for local models and
//!   tests.
//! - [`BulkExecutor`] defers enqueues and drains them in batches.
//! - [`AsyncBulkExecutor`] defers like the bulk executor and awaits an
//!   asynchronous fetch function at each drain.
//!
//! A nested `query`/`iterate` call issued while a session is open joins
//! the open session's queue instead of starting a second one, so a batch
//! can never deadlock waiting on itself.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StreamError;
use crate::stream::{drive, Fetch, Many, One, ZeroOrOne};

/// Default number of keys per dispatched batch.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// The injected synchronous batch fetch function.
///
/// Keys absent from the returned map resolve to "no value" rather than
/// failing. Deadlines and retries are the implementation's concern; the
/// executors wait indefinitely.
pub trait BatchFetch<K, V> {
    /// Fetch values for a batch of keys.
    fn execute(&self, keys: Vec<K>) -> anyhow::Result<HashMap<K, V>>;
}

/// The injected asynchronous batch fetch function.
#[async_trait]
pub trait AsyncBatchFetch<K: Send + 'static, V: Send + 'static>: Send + Sync {
    /// Fetch values for a batch of keys.
    async fn execute(&self, keys: Vec<K>) -> anyhow::Result<HashMap<K, V>>;
}

struct FnFetch<F>(F);

impl<K, V, F> BatchFetch<K, V> for FnFetch<F>
where
    F: Fn(Vec<K>) -> anyhow::Result<HashMap<K, V>>,
{
    fn execute(&self, keys: Vec<K>) -> anyhow::Result<HashMap<K, V>> {
        (self.0)(keys)
    }
}

/// Which end of the pending queue a batch is taken from.
///
/// Newest-first approximates a depth-first traversal of dependent reads
/// and is the default; it is a heuristic, not a correctness requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainOrder {
    /// Send the most recently enqueued keys first.
    #[default]
    NewestFirst,
    /// Send the oldest enqueued keys first.
    OldestFirst,
}

/// A handle through which stream expressions issue point reads.
///
/// Both session kinds implement this, which is what lets the same
/// expression-building code run direct or batched.
pub trait FetchSession<K, V> {
    /// Request the value for `key`, returning a placeholder that resolves
    /// when the session executes the read.
    fn enqueue(&self, key: K) -> ZeroOrOne<V>;
}

// ============================================================================
// Pending slots
// ============================================================================

enum SlotState<V> {
    Pending,
    Resolved(Option<V>),
    Failed(StreamError),
}

pub(crate) struct SlotHandle<V>(Arc<Mutex<SlotState<V>>>);

impl<V> Clone for SlotHandle<V> {
    fn clone(&self) -> Self {
        SlotHandle(self.0.clone())
    }
}

impl<V: Clone> SlotHandle<V> {
    fn new() -> Self {
        SlotHandle(Arc::new(Mutex::new(SlotState::Pending)))
    }

    fn poll(&self) -> Option<Result<Option<V>, StreamError>> {
        match &*self.0.lock() {
            SlotState::Pending => None,
            SlotState::Resolved(value) => Some(Ok(value.clone())),
            SlotState::Failed(err) => Some(Err(err.clone())),
        }
    }

    fn resolve(&self, value: Option<V>) {
        let mut state = self.0.lock();
        match *state {
            SlotState::Pending => *state = SlotState::Resolved(value),
            _ => panic!("pending batch slot resolved twice"),
        }
    }

    fn fail(&self, err: StreamError) {
        let mut state = self.0.lock();
        match *state {
            SlotState::Pending => *state = SlotState::Failed(err),
            _ => panic!("pending batch slot resolved twice"),
        }
    }
}

fn await_slot<V: Clone + 'static>(slot: SlotHandle<V>) -> Fetch<Option<V>> {
    match slot.poll() {
        Some(Ok(value)) => Fetch::Done(value),
        Some(Err(err)) => Fetch::Fail(err),
        None => Fetch::Blocked(Box::new(move || await_slot(slot))),
    }
}

/// Resolve every slot of a dispatched batch from the fetch outcome. On
/// failure, exactly the slots of this batch fail; later-enqueued slots
/// are untouched.
fn settle<K: Eq + Hash, V: Clone>(
    batch: Vec<(K, SlotHandle<V>)>,
    outcome: anyhow::Result<HashMap<K, V>>,
) {
    match outcome {
        Ok(mut values) => {
            for (key, slot) in batch {
                slot.resolve(values.remove(&key));
            }
        }
        Err(err) => {
            let shared = StreamError::batch(err);
            for (_, slot) in batch {
                slot.fail(shared.clone());
            }
        }
    }
}

// ============================================================================
// Session state
// ============================================================================

struct SessionInner<K, V> {
    slots: ahash::HashMap<K, SlotHandle<V>>,
    pending: Vec<K>,
    depth: usize,
}

struct SessionState<K, V> {
    inner: Mutex<SessionInner<K, V>>,
}

impl<K, V> SessionState<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn new() -> Self {
        SessionState {
            inner: Mutex::new(SessionInner {
                slots: ahash::HashMap::default(),
                pending: Vec::new(),
                depth: 0,
            }),
        }
    }

    fn enqueue(&self, key: K) -> SlotHandle<V> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.slots.get(&key) {
            return existing.clone();
        }
        let slot = SlotHandle::new();
        inner.slots.insert(key.clone(), slot.clone());
        inner.pending.push(key);
        slot
    }

    fn take_batch(&self, batch_size: usize, order: DrainOrder) -> Vec<(K, SlotHandle<V>)> {
        let mut inner = self.inner.lock();
        let count = batch_size.min(inner.pending.len());
        let keys: Vec<K> = match order {
            DrainOrder::NewestFirst => {
                let split = inner.pending.len() - count;
                inner.pending.split_off(split)
            }
            DrainOrder::OldestFirst => inner.pending.drain(..count).collect(),
        };
        keys.into_iter()
            .map(|key| {
                let slot = inner
                    .slots
                    .get(&key)
                    .cloned()
                    .expect("every pending key has a slot");
                (key, slot)
            })
            .collect()
    }

    fn open(&self) {
        self.inner.lock().depth += 1;
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.depth == 0 {
            panic!("batching session closed twice");
        }
        inner.depth -= 1;
        if inner.depth == 0 {
            // End of the outermost session: dedup state and any slots
            // nobody waited for do not carry over.
            inner.slots.clear();
            inner.pending.clear();
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Session handle of a [`DirectExecutor`]; every enqueue executes
/// immediately as a batch of one.
pub struct DirectSession<K, V> {
    fetch: Arc<dyn BatchFetch<K, V>>,
}

impl<K, V> Clone for DirectSession<K, V> {
    fn clone(&self) -> Self {
        DirectSession {
            fetch: self.fetch.clone(),
        }
    }
}

impl<K, V> FetchSession<K, V> for DirectSession<K, V>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
{
    fn enqueue(&self, key: K) -> ZeroOrOne<V> {
        match self.fetch.execute(vec![key.clone()]) {
            Ok(mut values) => ZeroOrOne::of(values.remove(&key)),
            Err(err) => ZeroOrOne::from_fetch(Fetch::Fail(StreamError::batch(err))),
        }
    }
}

/// Session handle of a [`BulkExecutor`] or [`AsyncBulkExecutor`]; every
/// enqueue records a pending slot.
pub struct BulkSession<K, V> {
    state: Arc<SessionState<K, V>>,
}

impl<K, V> Clone for BulkSession<K, V> {
    fn clone(&self) -> Self {
        BulkSession {
            state: self.state.clone(),
        }
    }
}

impl<K, V> FetchSession<K, V> for BulkSession<K, V>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
{
    fn enqueue(&self, key: K) -> ZeroOrOne<V> {
        ZeroOrOne::from_fetch(await_slot(self.state.enqueue(key)))
    }
}

// ============================================================================
// Executors
// ============================================================================

/// Executes stream expressions with immediate, synchronous reads.
pub struct DirectExecutor<K, V> {
    fetch: Arc<dyn BatchFetch<K, V>>,
}

impl<K, V> Clone for DirectExecutor<K, V> {
    fn clone(&self) -> Self {
        DirectExecutor {
            fetch: self.fetch.clone(),
        }
    }
}

impl<K, V> DirectExecutor<K, V>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
{
    /// Create an executor over a fetch implementation.
    pub fn new(fetch: impl BatchFetch<K, V> + 'static) -> Self {
        DirectExecutor {
            fetch: Arc::new(fetch),
        }
    }

    /// Create an executor over a plain function.
    pub fn from_fn(f: impl Fn(Vec<K>) -> anyhow::Result<HashMap<K, V>> + 'static) -> Self {
        Self::new(FnFetch(f))
    }

    fn run_fetch<T: 'static>(&self, fetch: Fetch<T>) -> Result<T, StreamError> {
        // Nothing is ever deferred here, so a blocked value can only be a
        // placeholder from some other executor's session.
        drive(fetch, || Ok(false))
    }

    /// Run a single-valued expression.
    pub fn query<T: 'static>(
        &self,
        build: impl FnOnce(&DirectSession<K, V>) -> One<T>,
    ) -> Result<T, StreamError> {
        let session = DirectSession {
            fetch: self.fetch.clone(),
        };
        self.run_fetch(build(&session).into_fetch())
    }

    /// Run an optional expression.
    pub fn query_optional<T: 'static>(
        &self,
        build: impl FnOnce(&DirectSession<K, V>) -> ZeroOrOne<T>,
    ) -> Result<Option<T>, StreamError> {
        let session = DirectSession {
            fetch: self.fetch.clone(),
        };
        self.run_fetch(build(&session).into_fetch())
    }

    /// Run a many-valued expression and collect its values.
    pub fn collect<T: 'static>(
        &self,
        build: impl FnOnce(&DirectSession<K, V>) -> Many<T>,
    ) -> Result<Vec<T>, StreamError> {
        let session = DirectSession {
            fetch: self.fetch.clone(),
        };
        self.run_fetch(build(&session).into_fetch())
    }

    /// Run a many-valued expression, handing each value to `each`.
    pub fn iterate<T: 'static>(
        &self,
        build: impl FnOnce(&DirectSession<K, V>) -> Many<T>,
        mut each: impl FnMut(T),
    ) -> Result<(), StreamError> {
        for value in self.collect(build)? {
            each(value);
        }
        Ok(())
    }
}

/// Executes stream expressions with deferred, batched reads.
pub struct BulkExecutor<K, V> {
    fetch: Arc<dyn BatchFetch<K, V>>,
    state: Arc<SessionState<K, V>>,
    batch_size: usize,
    order: DrainOrder,
}

impl<K, V> Clone for BulkExecutor<K, V> {
    fn clone(&self) -> Self {
        BulkExecutor {
            fetch: self.fetch.clone(),
            state: self.state.clone(),
            batch_size: self.batch_size,
            order: self.order,
        }
    }
}

impl<K, V> BulkExecutor<K, V>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
{
    /// Create an executor over a fetch implementation.
    pub fn new(fetch: impl BatchFetch<K, V> + 'static) -> Self {
        BulkExecutor {
            fetch: Arc::new(fetch),
            state: Arc::new(SessionState::new()),
            batch_size: DEFAULT_BATCH_SIZE,
            order: DrainOrder::default(),
        }
    }

    /// Create an executor over a plain function.
    pub fn from_fn(f: impl Fn(Vec<K>) -> anyhow::Result<HashMap<K, V>> + 'static) -> Self {
        Self::new(FnFetch(f))
    }

    /// Set the maximum number of keys per dispatched batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the draining order.
    pub fn with_drain_order(mut self, order: DrainOrder) -> Self {
        self.order = order;
        self
    }

    fn open_session(&self) -> BulkSession<K, V> {
        self.state.open();
        BulkSession {
            state: self.state.clone(),
        }
    }

    fn drain_one_batch(&self) -> Result<bool, StreamError> {
        let batch = self.state.take_batch(self.batch_size, self.order);
        if batch.is_empty() {
            return Ok(false);
        }
        tracing::debug!(keys = batch.len(), "dispatching batch");
        let keys: Vec<K> = batch.iter().map(|(key, _)| key.clone()).collect();
        settle(batch, self.fetch.execute(keys));
        Ok(true)
    }

    fn run_fetch<T: 'static>(&self, fetch: Fetch<T>) -> Result<T, StreamError> {
        drive(fetch, || self.drain_one_batch())
    }

    /// Run a single-valued expression. Calls issued while another
    /// `query`/`iterate` on this executor is running join its session.
    pub fn query<T: 'static>(
        &self,
        build: impl FnOnce(&BulkSession<K, V>) -> One<T>,
    ) -> Result<T, StreamError> {
        let session = self.open_session();
        let fetch = build(&session).into_fetch();
        let result = self.run_fetch(fetch);
        self.state.close();
        result
    }

    /// Run an optional expression.
    pub fn query_optional<T: 'static>(
        &self,
        build: impl FnOnce(&BulkSession<K, V>) -> ZeroOrOne<T>,
    ) -> Result<Option<T>, StreamError> {
        let session = self.open_session();
        let fetch = build(&session).into_fetch();
        let result = self.run_fetch(fetch);
        self.state.close();
        result
    }

    /// Run a many-valued expression and collect its values.
    pub fn collect<T: 'static>(
        &self,
        build: impl FnOnce(&BulkSession<K, V>) -> Many<T>,
    ) -> Result<Vec<T>, StreamError> {
        let session = self.open_session();
        let fetch = build(&session).into_fetch();
        let result = self.run_fetch(fetch);
        self.state.close();
        result
    }

    /// Run a many-valued expression, handing each value to `each`.
    pub fn iterate<T: 'static>(
        &self,
        build: impl FnOnce(&BulkSession<K, V>) -> Many<T>,
        mut each: impl FnMut(T),
    ) -> Result<(), StreamError> {
        for value in self.collect(build)? {
            each(value);
        }
        Ok(())
    }
}

/// Executes stream expressions with deferred reads against an
/// asynchronous fetch function.
///
/// Suspension happens only at batch boundaries. The produced futures
/// borrow non-`Send` continuation state, so they must be driven on a
/// single-threaded runtime or `LocalSet`.
pub struct AsyncBulkExecutor<K: Send + 'static, V: Send + 'static> {
    fetch: Arc<dyn AsyncBatchFetch<K, V>>,
    state: Arc<SessionState<K, V>>,
    batch_size: usize,
    order: DrainOrder,
}

impl<K, V> AsyncBulkExecutor<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create an executor over an asynchronous fetch implementation.
    pub fn new(fetch: impl AsyncBatchFetch<K, V> + 'static) -> Self {
        AsyncBulkExecutor {
            fetch: Arc::new(fetch),
            state: Arc::new(SessionState::new()),
            batch_size: DEFAULT_BATCH_SIZE,
            order: DrainOrder::default(),
        }
    }

    /// Set the maximum number of keys per dispatched batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the draining order.
    pub fn with_drain_order(mut self, order: DrainOrder) -> Self {
        self.order = order;
        self
    }

    async fn drain_one_batch(&self) -> Result<bool, StreamError> {
        let batch = self.state.take_batch(self.batch_size, self.order);
        if batch.is_empty() {
            return Ok(false);
        }
        tracing::debug!(keys = batch.len(), "dispatching async batch");
        let keys: Vec<K> = batch.iter().map(|(key, _)| key.clone()).collect();
        let outcome = self.fetch.execute(keys).await;
        settle(batch, outcome);
        Ok(true)
    }

    async fn run_fetch<T: 'static>(&self, mut fetch: Fetch<T>) -> Result<T, StreamError> {
        loop {
            match fetch {
                Fetch::Done(value) => return Ok(value),
                Fetch::Fail(err) => return Err(err),
                Fetch::Lazy(thunk) => fetch = thunk(),
                Fetch::Blocked(thunk) => {
                    if !self.drain_one_batch().await? {
                        return Err(StreamError::Detached);
                    }
                    fetch = thunk();
                }
            }
        }
    }

    /// Run a single-valued expression.
    pub async fn query<T: 'static>(
        &self,
        build: impl FnOnce(&BulkSession<K, V>) -> One<T>,
    ) -> Result<T, StreamError> {
        self.state.open();
        let session = BulkSession {
            state: self.state.clone(),
        };
        let fetch = build(&session).into_fetch();
        let result = self.run_fetch(fetch).await;
        self.state.close();
        result
    }

    /// Run a many-valued expression and collect its values.
    pub async fn collect<T: 'static>(
        &self,
        build: impl FnOnce(&BulkSession<K, V>) -> Many<T>,
    ) -> Result<Vec<T>, StreamError> {
        self.state.open();
        let session = BulkSession {
            state: self.state.clone(),
        };
        let fetch = build(&session).into_fetch();
        let result = self.run_fetch(fetch).await;
        self.state.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fetch fixture that uppercases keys and records every batch.
    struct Upper {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl Upper {
        fn new() -> (Self, Arc<Mutex<Vec<Vec<String>>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Upper {
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl BatchFetch<String, String> for Upper {
        fn execute(&self, keys: Vec<String>) -> anyhow::Result<HashMap<String, String>> {
            self.calls.lock().push(keys.clone());
            if keys.iter().any(|k| k == "bad") {
                anyhow::bail!("backend rejected the batch");
            }
            Ok(keys
                .into_iter()
                .filter(|k| k != "missing")
                .map(|k| (k.clone(), k.to_uppercase()))
                .collect())
        }
    }

    #[test]
    fn direct_executor_answers_immediately() {
        let (fetch, calls) = Upper::new();
        let ex = DirectExecutor::new(fetch);
        let out = ex
            .query(|s| s.enqueue("a".to_string()).or_value("-".into()))
            .unwrap();
        assert_eq!(out, "A");
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn duplicate_keys_fetch_once_and_batches_are_bounded() {
        let (fetch, calls) = Upper::new();
        let ex = BulkExecutor::new(fetch).with_batch_size(2);
        let out = ex
            .collect(|s| {
                Many::collect_optional([
                    s.enqueue("k1".to_string()),
                    s.enqueue("k2".to_string()),
                    s.enqueue("k1".to_string()),
                    s.enqueue("k3".to_string()),
                ])
            })
            .unwrap();
        // Both k1 placeholders resolve to the same value, in enqueue order.
        assert_eq!(out, vec!["K1", "K2", "K1", "K3"]);

        let calls = calls.lock();
        assert_eq!(calls.len(), 2, "three distinct keys, batch size two");
        assert!(calls.iter().all(|batch| batch.len() <= 2));
        let mut fetched: Vec<String> = calls.iter().flatten().cloned().collect();
        fetched.sort();
        assert_eq!(fetched, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn newest_enqueued_keys_drain_first() {
        let (fetch, calls) = Upper::new();
        let ex = BulkExecutor::new(fetch).with_batch_size(1);
        ex.collect(|s| {
            Many::collect_optional([
                s.enqueue("a".to_string()),
                s.enqueue("b".to_string()),
                s.enqueue("c".to_string()),
            ])
        })
        .unwrap();
        assert_eq!(
            *calls.lock(),
            vec![vec!["c".to_string()], vec!["b".to_string()], vec!["a".to_string()]]
        );
    }

    #[test]
    fn oldest_first_draining_is_available() {
        let (fetch, calls) = Upper::new();
        let ex = BulkExecutor::new(fetch)
            .with_batch_size(1)
            .with_drain_order(DrainOrder::OldestFirst);
        ex.collect(|s| {
            Many::collect_optional([s.enqueue("a".to_string()), s.enqueue("b".to_string())])
        })
        .unwrap();
        assert_eq!(
            *calls.lock(),
            vec![vec!["a".to_string()], vec!["b".to_string()]]
        );
    }

    #[test]
    fn absent_keys_resolve_to_no_value() {
        let (fetch, _) = Upper::new();
        let ex = BulkExecutor::new(fetch);
        let out = ex
            .query_optional(|s| s.enqueue("missing".to_string()))
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn a_failed_batch_fails_only_its_own_slots() {
        let (fetch, _) = Upper::new();
        // Batch size one and oldest-first, so "good" and "bad" run in
        // separate batches with "good" first.
        let ex = BulkExecutor::new(fetch)
            .with_batch_size(1)
            .with_drain_order(DrainOrder::OldestFirst);
        let out = ex
            .query(|s| {
                let good = s.enqueue("good".to_string()).or_value("-".into());
                let bad = s
                    .enqueue("bad".to_string())
                    .on_error_return(None)
                    .or_value("recovered".into());
                good.zip(bad)
            })
            .unwrap();
        assert_eq!(out, ("GOOD".to_string(), "recovered".to_string()));

        // The queue is not corrupted for later sessions.
        let again = ex
            .query(|s| s.enqueue("next".to_string()).or_value("-".into()))
            .unwrap();
        assert_eq!(again, "NEXT");
    }

    #[test]
    fn batch_errors_reach_the_caller() {
        let (fetch, _) = Upper::new();
        let ex = BulkExecutor::new(fetch);
        let err = ex
            .query_optional(|s| s.enqueue("bad".to_string()))
            .expect_err("failing batch");
        assert!(matches!(err, StreamError::Batch(_)));
    }

    #[test]
    fn nested_queries_join_the_open_session() {
        let (fetch, calls) = Upper::new();
        let ex = BulkExecutor::new(fetch);
        let nested = ex.clone();
        let out = ex
            .query(|s| {
                s.enqueue("outer".to_string())
                    .or_value("-".into())
                    .map(move |outer| {
                        let inner = nested
                            .query(|s| s.enqueue("inner".to_string()).or_value("-".into()))
                            .expect("nested query");
                        format!("{outer}/{inner}")
                    })
            })
            .unwrap();
        assert_eq!(out, "OUTER/INNER");
        assert!(!calls.lock().is_empty());
    }

    #[test]
    fn deduplication_resets_between_sessions() {
        let (fetch, calls) = Upper::new();
        let ex = BulkExecutor::new(fetch);
        for _ in 0..2 {
            ex.query(|s| s.enqueue("k".to_string()).or_value("-".into()))
                .unwrap();
        }
        assert_eq!(calls.lock().len(), 2, "each session fetches the key again");
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn resolving_a_slot_twice_is_fatal() {
        let slot: SlotHandle<i32> = SlotHandle::new();
        slot.resolve(Some(1));
        slot.resolve(Some(2));
    }

    #[test]
    #[should_panic(expected = "closed twice")]
    fn closing_a_session_twice_is_fatal() {
        let state: SessionState<String, String> = SessionState::new();
        state.open();
        state.close();
        state.close();
    }

    struct AsyncUpper {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl AsyncBatchFetch<String, String> for AsyncUpper {
        async fn execute(&self, keys: Vec<String>) -> anyhow::Result<HashMap<String, String>> {
            self.calls.lock().push(keys.clone());
            Ok(keys.into_iter().map(|k| (k.clone(), k.to_uppercase())).collect())
        }
    }

    #[tokio::test]
    async fn async_executor_batches_like_the_sync_one() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ex = AsyncBulkExecutor::new(AsyncUpper {
            calls: calls.clone(),
        })
        .with_batch_size(2);
        let out = ex
            .collect(|s| {
                Many::collect_optional([
                    s.enqueue("x".to_string()),
                    s.enqueue("y".to_string()),
                    s.enqueue("z".to_string()),
                ])
            })
            .await
            .unwrap();
        assert_eq!(out, vec!["X", "Y", "Z"]);
        assert_eq!(calls.lock().len(), 2);
    }
}
