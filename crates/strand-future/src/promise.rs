// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Promise/completer shared state.
//!
//! Listeners run synchronously on the resolving thread, in registration
//! order. A listener must not attach further listeners to the promise it
//! is being invoked from; that is detected in debug builds.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use strand_sched::{panic_message, TaskQueue, TaskQueueExt};

/// Error half of a promise resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromiseError {
    /// The last completer was dropped while the promise was pending.
    #[error("forgotten before completion")]
    Forgotten,

    /// The producing side was torn down.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The producing computation failed.
    #[error("{0}")]
    Failed(String),
}

/// Resolved state of a promise.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Value(T),
    Error(PromiseError),
}

impl<T> Outcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&PromiseError> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Error(e) => Some(e),
        }
    }

    pub fn as_result(&self) -> Result<&T, &PromiseError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(e),
        }
    }

    pub fn into_result(self) -> Result<T, PromiseError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(e),
        }
    }
}

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct Inner<T> {
    outcome: Option<Arc<Outcome<T>>>,
    listeners: Vec<Listener<T>>,
    completers: u64,
    notifying: bool,
}

struct SharedState<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> SharedState<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                outcome: None,
                listeners: Vec::new(),
                completers: 0,
                notifying: false,
            }),
        }
    }

    fn resolve(&self, outcome: Outcome<T>) {
        let (outcome, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.outcome.is_none(), "promise resolved twice");
            if inner.outcome.is_some() {
                return;
            }
            let outcome = Arc::new(outcome);
            inner.outcome = Some(outcome.clone());
            inner.notifying = true;
            (outcome, std::mem::take(&mut inner.listeners))
        };
        for listener in listeners {
            listener(&outcome);
        }
        self.inner.lock().unwrap().notifying = false;
    }

    fn listen(&self, listener: Listener<T>) {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(
                !inner.notifying,
                "do not add a listener from a listener of the same promise"
            );
            if inner.outcome.is_none() {
                inner.listeners.push(listener);
                return;
            }
            inner.outcome.as_ref().unwrap().clone()
        };
        listener(&outcome);
    }

    fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        self.inner.lock().unwrap().outcome.clone()
    }

    fn ref_completer(&self) {
        self.inner.lock().unwrap().completers += 1;
    }

    fn unref_completer(&self) {
        let forget = {
            let mut inner = self.inner.lock().unwrap();
            inner.completers -= 1;
            inner.completers == 0 && inner.outcome.is_none()
        };
        if forget {
            self.resolve(Outcome::Error(PromiseError::Forgotten));
        }
    }
}

enum Repr<T> {
    Ready(Arc<Outcome<T>>),
    Shared(Arc<SharedState<T>>),
}

impl<T> Clone for Repr<T> {
    fn clone(&self) -> Self {
        match self {
            Repr::Ready(outcome) => Repr::Ready(outcome.clone()),
            Repr::Shared(state) => Repr::Shared(state.clone()),
        }
    }
}

/// Consumer side of a single-shot deferred value.
pub struct Promise<T> {
    repr: Repr<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            repr: self.repr.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// A promise that is already a value. Stays unshared until cloned.
    pub fn resolved(value: T) -> Self {
        Self {
            repr: Repr::Ready(Arc::new(Outcome::Value(value))),
        }
    }

    /// A promise that is already an error.
    pub fn rejected(error: PromiseError) -> Self {
        Self {
            repr: Repr::Ready(Arc::new(Outcome::Error(error))),
        }
    }

    pub fn is_pending(&self) -> bool {
        match &self.repr {
            Repr::Ready(_) => false,
            Repr::Shared(state) => state.outcome().is_none(),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self.outcome_arc().as_deref(), Some(Outcome::Value(_)))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome_arc().as_deref(), Some(Outcome::Error(_)))
    }

    /// Resolved error, if any.
    pub fn error(&self) -> Option<PromiseError> {
        match self.outcome_arc().as_deref() {
            Some(Outcome::Error(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Resolved value, if any.
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        match self.outcome_arc().as_deref() {
            Some(Outcome::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    fn outcome_arc(&self) -> Option<Arc<Outcome<T>>> {
        match &self.repr {
            Repr::Ready(outcome) => Some(outcome.clone()),
            Repr::Shared(state) => state.outcome(),
        }
    }

    /// Register `listener`; runs now if already resolved.
    pub fn listen<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        match &self.repr {
            Repr::Ready(outcome) => listener(outcome),
            Repr::Shared(state) => state.listen(Box::new(listener)),
        }
        self
    }

    /// Run `f` only on a value resolution.
    pub fn then<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.listen(move |outcome| {
            if let Outcome::Value(v) = outcome {
                f(v);
            }
        })
    }

    /// Run `f` only on an error resolution.
    pub fn catch<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&PromiseError) + Send + 'static,
    {
        self.listen(move |outcome| {
            if let Outcome::Error(e) = outcome {
                f(e);
            }
        })
    }

    /// Chain a value-producing continuation. Errors pass through.
    pub fn and_then<U, F>(&self, f: F) -> Promise<U>
    where
        T: Clone,
        U: Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, PromiseError> + Send + 'static,
    {
        let comp = Completer::new();
        let ret = comp.promise();
        self.listen(move |outcome| match outcome {
            Outcome::Value(v) => comp.run({
                let v = v.clone();
                move || f(v)
            }),
            Outcome::Error(e) => comp.fail(e.clone()),
        });
        ret
    }

    /// Chain a promise-producing continuation, flattening the result.
    pub fn and_then_promise<U, F>(&self, f: F) -> Promise<U>
    where
        T: Clone,
        U: Send + Sync + 'static + Clone,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let comp = Completer::new();
        let ret = comp.promise();
        self.listen(move |outcome| match outcome {
            Outcome::Value(v) => {
                f(v.clone()).chain(&comp);
            }
            Outcome::Error(e) => comp.fail(e.clone()),
        });
        ret
    }

    /// Forward this promise's outcome into `comp`.
    pub fn chain(&self, comp: &Completer<T>) -> &Self
    where
        T: Clone,
    {
        let comp = comp.clone();
        self.listen(move |outcome| match outcome {
            Outcome::Value(v) => comp.complete(v.clone()),
            Outcome::Error(e) => comp.fail(e.clone()),
        })
    }

    /// Keep `keep` alive until this promise resolves.
    pub fn attach<V>(&self, keep: V) -> &Self
    where
        V: Send + 'static,
    {
        self.listen(move |_| drop(keep))
    }
}

/// Producer side of a promise. Cloneable; the promise is forgotten when
/// the last clone drops unresolved.
pub struct Completer<T> {
    shared: Arc<SharedState<T>>,
}

impl<T> Completer<T> {
    pub fn new() -> Self {
        let shared = Arc::new(SharedState::new());
        shared.ref_completer();
        Self { shared }
    }
}

impl<T> Default for Completer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        self.shared.ref_completer();
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.shared.unref_completer();
    }
}

impl<T: Send + Sync + 'static> Completer<T> {
    pub fn promise(&self) -> Promise<T> {
        Promise {
            repr: Repr::Shared(self.shared.clone()),
        }
    }

    /// Resolve with a value. Resolving twice is a usage error.
    pub fn complete(&self, value: T) {
        self.shared.resolve(Outcome::Value(value));
    }

    /// Resolve with an error. Resolving twice is a usage error.
    pub fn fail(&self, error: PromiseError) {
        self.shared.resolve(Outcome::Error(error));
    }

    /// Run `f`, completing with its value or failing with its error.
    /// Panics are converted to [`PromiseError::Failed`].
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() -> Result<T, PromiseError>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => self.complete(value),
            Ok(Err(error)) => self.fail(error),
            Err(payload) => self.fail(PromiseError::Failed(panic_message(payload.as_ref()))),
        }
    }

    /// Run `f` on the async queue, then resolve on the sync queue, so
    /// consumers observe the resolution on the sync worker.
    pub fn run_async<A, S, F>(&self, aq: &Arc<dyn TaskQueue<A>>, sq: &Arc<dyn TaskQueue<S>>, f: F)
    where
        A: 'static,
        S: 'static,
        F: FnOnce(&mut A) -> Result<T, PromiseError> + Send + 'static,
    {
        let comp = self.clone();
        let sq = sq.clone();
        aq.exec(move |scope: &mut A| {
            let result = catch_unwind(AssertUnwindSafe(|| f(scope)))
                .unwrap_or_else(|payload| {
                    Err(PromiseError::Failed(panic_message(payload.as_ref())))
                });
            sq.exec(move |_: &mut S| match result {
                Ok(value) => comp.complete(value),
                Err(error) => comp.fail(error),
            });
        });
    }

    /// Resolve once every promise in `deps` has resolved: with the first
    /// error among them, or with `f` applied to their values.
    pub fn run_after<D, F>(&self, deps: Vec<Promise<D>>, f: F)
    where
        D: Clone + Send + Sync + 'static,
        F: FnOnce(Vec<D>) -> Result<T, PromiseError> + Send + 'static,
    {
        if deps.is_empty() {
            self.run(move || f(Vec::new()));
            return;
        }

        struct Join<D> {
            slots: Vec<Option<Outcome<D>>>,
            remaining: usize,
        }

        let join = Arc::new(Mutex::new(Join {
            slots: (0..deps.len()).map(|_| None).collect(),
            remaining: deps.len(),
        }));
        let f = Arc::new(Mutex::new(Some(f)));

        for (i, dep) in deps.iter().enumerate() {
            let comp = self.clone();
            let join = join.clone();
            let f = f.clone();
            dep.listen(move |outcome| {
                let slots = {
                    let mut join = join.lock().unwrap();
                    join.slots[i] = Some(outcome.clone());
                    join.remaining -= 1;
                    if join.remaining > 0 {
                        return;
                    }
                    std::mem::take(&mut join.slots)
                };

                let mut values = Vec::with_capacity(slots.len());
                for slot in slots {
                    match slot.expect("all dependencies resolved") {
                        Outcome::Value(v) => values.push(v),
                        Outcome::Error(e) => {
                            comp.fail(e);
                            return;
                        }
                    }
                }
                let f = f.lock().unwrap().take().expect("join body runs once");
                comp.run(move || f(values));
            });
        }
    }

    /// Keep `keep` alive until the promise resolves.
    pub fn attach<V>(&self, keep: V) -> &Self
    where
        V: Send + 'static,
    {
        self.shared.listen(Box::new(move |_| drop(keep)));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strand_sched::Task;

    /// Queue mock that runs every task immediately on the caller.
    struct InlineQueue;

    struct TestScope;

    impl TaskQueue<TestScope> for InlineQueue {
        fn push(&self, task: Task<TestScope>) {
            task.run(&mut TestScope);
        }
    }

    fn inline_queue() -> Arc<dyn TaskQueue<TestScope>> {
        Arc::new(InlineQueue)
    }

    #[test]
    fn resolved_promise_runs_listener_in_place() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        Promise::resolved(7u32).then(move |v| {
            assert_eq!(*v, 7);
            hits2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn listeners_fire_in_registration_order_on_complete() {
        let comp = Completer::new();
        let promise = comp.promise();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3u32 {
            let order = order.clone();
            promise.listen(move |_| order.lock().unwrap().push(i));
        }
        assert!(promise.is_pending());

        comp.complete(1u32);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(promise.is_value());
        assert_eq!(promise.value(), Some(1));
    }

    #[test]
    fn listener_after_resolution_fires_immediately() {
        let comp = Completer::new();
        comp.complete(5u32);
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        comp.promise().then(move |_| {
            hits2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropping_last_completer_forgets() {
        let comp = Completer::<u32>::new();
        let promise = comp.promise();
        drop(comp);
        assert_eq!(promise.error(), Some(PromiseError::Forgotten));
    }

    #[test]
    fn cloned_completer_keeps_promise_pending() {
        let comp = Completer::<u32>::new();
        let other = comp.clone();
        let promise = comp.promise();
        drop(comp);
        assert!(promise.is_pending());
        other.complete(2);
        assert_eq!(promise.value(), Some(2));
    }

    #[test]
    fn catch_sees_only_errors() {
        let caught = Arc::new(Mutex::new(None));
        let caught2 = caught.clone();
        Promise::<u32>::rejected(PromiseError::Aborted("gone".into())).catch(move |e| {
            *caught2.lock().unwrap() = Some(e.clone());
        });
        assert_eq!(
            *caught.lock().unwrap(),
            Some(PromiseError::Aborted("gone".into()))
        );

        let hit = Arc::new(AtomicU32::new(0));
        let hit2 = hit.clone();
        Promise::resolved(1u32).catch(move |_| {
            hit2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hit.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn and_then_chains_values_and_propagates_errors() {
        let doubled = Promise::resolved(21u32).and_then(|v| Ok(v * 2));
        assert_eq!(doubled.value(), Some(42));

        let failed: Promise<u32> =
            Promise::<u32>::rejected(PromiseError::Forgotten).and_then(|v| Ok(v * 2));
        assert_eq!(failed.error(), Some(PromiseError::Forgotten));
    }

    #[test]
    fn and_then_promise_flattens() {
        let comp = Completer::new();
        let chained = Promise::resolved(3u32).and_then_promise({
            let promise = comp.promise();
            move |_| promise
        });
        assert!(chained.is_pending());
        comp.complete(30u32);
        assert_eq!(chained.value(), Some(30));
    }

    #[test]
    fn chain_forwards_outcome() {
        let comp = Completer::new();
        let target = comp.promise();
        Promise::resolved(9u32).chain(&comp);
        assert_eq!(target.value(), Some(9));
    }

    #[test]
    fn run_converts_panics_to_errors() {
        let comp = Completer::<u32>::new();
        let promise = comp.promise();
        comp.run(|| panic!("computation exploded"));
        assert_eq!(
            promise.error(),
            Some(PromiseError::Failed("computation exploded".into()))
        );
    }

    #[test]
    fn run_async_resolves_via_sync_queue() {
        let aq = inline_queue();
        let sq = inline_queue();
        let comp = Completer::new();
        let promise = comp.promise();
        comp.run_async(&aq, &sq, |_| Ok(777u32));
        assert_eq!(promise.value(), Some(777));
    }

    #[test]
    fn run_async_routes_failures() {
        let aq = inline_queue();
        let sq = inline_queue();
        let comp = Completer::<u32>::new();
        let promise = comp.promise();
        comp.run_async(&aq, &sq, |_| panic!("async body failed"));
        assert_eq!(
            promise.error(),
            Some(PromiseError::Failed("async body failed".into()))
        );
    }

    #[test]
    fn run_after_waits_for_all_dependencies() {
        let a = Completer::new();
        let b = Completer::new();
        let comp = Completer::new();
        let sum = comp.promise();
        comp.run_after(vec![a.promise(), b.promise()], |values: Vec<u32>| {
            Ok(values.iter().sum::<u32>())
        });
        drop(comp);

        assert!(sum.is_pending());
        a.complete(4);
        assert!(sum.is_pending());
        b.complete(5);
        assert_eq!(sum.value(), Some(9));
    }

    #[test]
    fn run_after_fails_with_first_error() {
        let a = Completer::<u32>::new();
        let b = Completer::<u32>::new();
        let comp = Completer::new();
        let joined: Promise<u32> = comp.promise();
        comp.run_after(vec![a.promise(), b.promise()], |_values| {
            panic!("must not run")
        });
        drop(comp);

        b.fail(PromiseError::Aborted("late".into()));
        a.fail(PromiseError::Aborted("early".into()));
        // First error in dependency order wins.
        assert_eq!(joined.error(), Some(PromiseError::Aborted("early".into())));
    }

    #[test]
    fn attach_extends_lifetime_until_resolution() {
        let keep = Arc::new(());
        let weak = Arc::downgrade(&keep);

        let comp = Completer::<u32>::new();
        comp.promise().attach(keep);
        assert!(weak.upgrade().is_some());

        comp.complete(1);
        assert!(weak.upgrade().is_none());
    }
}
