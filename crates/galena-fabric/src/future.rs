//! A single-assignment deferred result.
//!
//! A [`Future`] is a handle to a shared completion slot. Producers call
//! [`Future::resolve`] or [`Future::fail`] exactly once; consumers either
//! block on [`Future::wait`] or register callbacks. Cloning a future clones
//! the handle, not the slot.
//!
//! ```
//! # use galena_fabric::Future;
//! let f: Future<u32> = Future::new();
//! let doubled = f.then(|v| Ok(v * 2));
//! f.resolve(21);
//! assert_eq!(doubled.wait().unwrap(), 42);
//! ```
//!
//! Completion is one-shot: once a future is resolved or failed, later
//! attempts are ignored. The exception is [`Future::adopt`], which forwards
//! another future's eventual outcome into this one (recursively, when a
//! chained closure itself returns a future).

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::fault::Fault;
use crate::pool::WorkerPool;

/// When set, [`Future::fail`] records a backtrace that is logged alongside
/// an unhandled fault. Off by default: capture is not free.
static CAPTURE_FAULT_TRACES: AtomicBool = AtomicBool::new(false);

static DEFAULT_WAIT_TIMEOUT: RwLock<Option<Duration>> = RwLock::new(None);

/// Enables or disables backtrace capture at the point `fail` is called.
pub fn capture_fault_traces(enabled: bool) {
    CAPTURE_FAULT_TRACES.store(enabled, Ordering::Relaxed);
}

/// Sets the process-wide default timeout applied by [`Future::wait`].
/// `None` waits indefinitely.
pub fn set_default_wait_timeout(timeout: Option<Duration>) {
    *DEFAULT_WAIT_TIMEOUT.write().expect("timeout lock poisoned") = timeout;
}

type Callback<T> = Box<dyn FnOnce(T) + Send>;
type Errback = Box<dyn FnOnce(Fault) + Send>;

enum State<T> {
    Pending {
        on_ok: Vec<Callback<T>>,
        on_err: Vec<Errback>,
        /// True once any error callback or waiter has shown up; transferred
        /// into `Failed::observed` so the drop diagnostic stays accurate.
        err_observed: bool,
    },
    Resolved(T),
    Failed {
        fault: Fault,
        observed: bool,
        trace: Option<String>,
    },
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// A single-assignment deferred result; see the module docs.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T> {
    /// A pending future.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending {
                    on_ok: Vec::new(),
                    on_err: Vec::new(),
                    err_observed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// An already-resolved future.
    pub fn resolved(value: T) -> Self {
        let f = Self::new();
        let mut state = f.shared.state.lock().expect("future lock poisoned");
        *state = State::Resolved(value);
        drop(state);
        f
    }

    /// An already-failed future.
    pub fn failed(fault: Fault) -> Self {
        let f = Self::new();
        let mut state = f.shared.state.lock().expect("future lock poisoned");
        *state = State::Failed {
            fault,
            observed: false,
            trace: None,
        };
        drop(state);
        f
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.shared.state.lock().expect("future lock poisoned")
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Provides the result. Wakes all waiters and invokes success callbacks
    /// in registration order. Ignored if the future is already settled.
    pub fn resolve(&self, value: T) {
        let callbacks = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { on_ok, .. } => {
                    let cbs = std::mem::take(on_ok);
                    *state = State::Resolved(value.clone());
                    self.shared.cond.notify_all();
                    cbs
                }
                // One-shot: a settled future stays settled.
                _ => return,
            }
        };
        for cb in callbacks {
            cb(value.clone());
        }
    }

    /// Provides a failure. Wakes all waiters and invokes error callbacks in
    /// registration order. Ignored if the future is already settled.
    pub fn fail(&self, fault: Fault) {
        let trace = CAPTURE_FAULT_TRACES
            .load(Ordering::Relaxed)
            .then(|| Backtrace::force_capture().to_string());
        let errbacks = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending {
                    on_err,
                    err_observed,
                    ..
                } => {
                    let ebs = std::mem::take(on_err);
                    let observed = *err_observed || !ebs.is_empty();
                    *state = State::Failed {
                        fault: fault.clone(),
                        observed,
                        trace,
                    };
                    self.shared.cond.notify_all();
                    ebs
                }
                _ => return,
            }
        };
        for eb in errbacks {
            eb(fault.clone());
        }
    }

    /// Adopts another future: this one settles however `other` settles.
    /// This is the chaining form of `resolve`.
    pub fn adopt(&self, other: Future<T>) {
        let ok = self.clone();
        let err = self.clone();
        other.callbacks(move |v| ok.resolve(v), move |e| err.fail(e));
    }

    /// Registers a success callback. Invoked immediately if already
    /// resolved; dropped if the future failed.
    pub fn on_resolve(&self, cb: impl FnOnce(T) + Send + 'static) {
        let mut slot = Some(Box::new(cb) as Callback<T>);
        let immediate = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { on_ok, .. } => {
                    on_ok.push(slot.take().expect("callback present"));
                    None
                }
                State::Resolved(v) => Some(v.clone()),
                State::Failed { .. } => None,
            }
        };
        if let (Some(v), Some(cb)) = (immediate, slot) {
            cb(v);
        }
    }

    /// Registers an error callback. Invoked immediately if the future has
    /// already failed; dropped if it resolved.
    pub fn on_fail(&self, eb: impl FnOnce(Fault) + Send + 'static) {
        let mut slot = Some(Box::new(eb) as Errback);
        let immediate = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending {
                    on_err,
                    err_observed,
                    ..
                } => {
                    on_err.push(slot.take().expect("errback present"));
                    *err_observed = true;
                    None
                }
                State::Resolved(_) => None,
                State::Failed {
                    fault, observed, ..
                } => {
                    *observed = true;
                    Some(fault.clone())
                }
            }
        };
        if let (Some(fault), Some(eb)) = (immediate, slot) {
            eb(fault);
        }
    }

    /// Registers both callbacks at once.
    pub fn callbacks(
        &self,
        cb: impl FnOnce(T) + Send + 'static,
        eb: impl FnOnce(Fault) + Send + 'static,
    ) {
        self.on_resolve(cb);
        self.on_fail(eb);
    }

    /// Blocks until the future settles, honoring the process-wide default
    /// timeout (see [`set_default_wait_timeout`]).
    pub fn wait(&self) -> Result<T, Fault> {
        let timeout = *DEFAULT_WAIT_TIMEOUT.read().expect("timeout lock poisoned");
        self.wait_inner(timeout)
    }

    /// Blocks until the future settles or the timeout passes. A timed-out
    /// wait returns a timeout fault; the producer keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, Fault> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> Result<T, Fault> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            match &mut *state {
                State::Resolved(v) => return Ok(v.clone()),
                State::Failed {
                    fault, observed, ..
                } => {
                    *observed = true;
                    return Err(fault.clone());
                }
                State::Pending { err_observed, .. } => {
                    // A waiter counts as handling the error.
                    *err_observed = true;
                }
            }
            state = match deadline {
                None => self.shared.cond.wait(state).expect("future lock poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Fault::timeout(timeout.unwrap_or_default()));
                    }
                    self.shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .expect("future lock poisoned")
                        .0
                }
            };
        }
    }

    /// Returns a new future that settles with `f(value)` once this one
    /// resolves. A failure of this future is forwarded; an `Err` from `f`
    /// fails the new future.
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, Fault> + Send + 'static,
    {
        let next = Future::new();
        let ok = next.clone();
        let err = next.clone();
        self.callbacks(
            move |v| match f(v) {
                Ok(u) => ok.resolve(u),
                Err(fault) => ok.fail(fault),
            },
            move |fault| err.fail(fault),
        );
        next
    }

    /// Like [`Self::then`], but `f` returns a future which the result
    /// adopts. Chains of futures flatten to a single observable result.
    pub fn then_fut<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let next = Future::new();
        let ok = next.clone();
        let err = next.clone();
        self.callbacks(move |v| ok.adopt(f(v)), move |fault| err.fail(fault));
        next
    }

    /// Runs `f` immediately, capturing its outcome.
    pub fn from_fn(f: impl FnOnce() -> Result<T, Fault>) -> Future<T> {
        match f() {
            Ok(v) => Future::resolved(v),
            Err(fault) => Future::failed(fault),
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Dropping the last handle to a failed future nobody looked at is
        // almost always a lost error; say so.
        if let Ok(state) = self.state.get_mut()
            && let State::Failed {
                fault,
                observed: false,
                trace,
            } = state
        {
            match trace {
                Some(trace) => {
                    tracing::warn!(%fault, %trace, "unhandled fault in dropped future");
                }
                None => tracing::warn!(%fault, "unhandled fault in dropped future"),
            }
        }
    }
}

/// Runs `f` on the pool, returning a future for its outcome.
pub fn run_on<T: Clone + Send + 'static>(
    pool: &WorkerPool,
    f: impl FnOnce() -> Result<T, Fault> + Send + 'static,
) -> Future<T> {
    let future = Future::new();
    let settle = future.clone();
    pool.submit(move || match f() {
        Ok(v) => settle.resolve(v),
        Err(fault) => settle.fail(fault),
    });
    future
}

/// Runs a set of tasks in parallel on the pool.
///
/// The returned future resolves to the results in submission order. If any
/// task fails, the future fails with an aggregate fault carrying every
/// individual failure, and the successful results are discarded.
pub fn prun_on<T: Clone + Send + 'static>(
    pool: &WorkerPool,
    tasks: Vec<Box<dyn FnOnce() -> Result<T, Fault> + Send>>,
) -> Future<Vec<T>> {
    let future = Future::new();
    if tasks.is_empty() {
        future.resolve(Vec::new());
        return future;
    }

    struct Gather<T> {
        slots: Vec<Option<T>>,
        faults: Vec<Fault>,
        remaining: usize,
    }

    let gather = Arc::new(Mutex::new(Gather {
        slots: (0..tasks.len()).map(|_| None).collect(),
        faults: Vec::new(),
        remaining: tasks.len(),
    }));

    for (i, task) in tasks.into_iter().enumerate() {
        let gather = Arc::clone(&gather);
        let settle = future.clone();
        pool.submit(move || {
            let outcome = task();
            let mut g = gather.lock().expect("gather lock poisoned");
            match outcome {
                Ok(v) => g.slots[i] = Some(v),
                Err(fault) => g.faults.push(fault),
            }
            g.remaining -= 1;
            if g.remaining == 0 {
                if g.faults.is_empty() {
                    let results = g.slots.iter_mut().map(|s| s.take().expect("all slots filled")).collect();
                    drop(g);
                    settle.resolve(results);
                } else {
                    let faults = std::mem::take(&mut g.faults);
                    drop(g);
                    settle.fail(Fault::aggregate(faults));
                }
            }
        });
    }
    future
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn resolve_then_wait() {
        let f = Future::resolved(5u32);
        assert_eq!(f.wait().unwrap(), 5);
    }

    #[test]
    fn wait_blocks_until_resolved_elsewhere() {
        let f: Future<&'static str> = Future::new();
        let remote = f.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.resolve("done");
        });
        assert_eq!(f.wait().unwrap(), "done");
        t.join().unwrap();
    }

    #[test]
    fn completion_is_one_shot() {
        let f = Future::new();
        f.resolve(1u32);
        f.resolve(2);
        f.fail(Fault::msg("late"));
        assert_eq!(f.wait().unwrap(), 1);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let f: Future<u32> = Future::new();
        for tag in 0..3u32 {
            let seen = Arc::clone(&seen);
            f.on_resolve(move |v| seen.lock().unwrap().push((tag, v)));
        }
        f.resolve(9);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 9), (1, 9), (2, 9)]);
    }

    #[test]
    fn late_callback_fires_immediately() {
        let f = Future::resolved(3u32);
        let hit = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hit);
        f.on_resolve(move |v| h.store(v, Ordering::SeqCst));
        assert_eq!(hit.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failure_reaches_errback_and_waiter() {
        let f: Future<u32> = Future::new();
        let hit = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hit);
        f.on_fail(move |_| {
            h.store(1, Ordering::SeqCst);
        });
        f.fail(Fault::msg("nope"));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert!(f.wait().is_err());
    }

    #[test]
    fn then_maps_the_value() {
        let f: Future<u32> = Future::new();
        let g = f.then(|v| Ok(v + 1)).then(|v| Ok(v * 10));
        f.resolve(3);
        assert_eq!(g.wait().unwrap(), 40);
    }

    #[test]
    fn then_forwards_upstream_failure() {
        let f: Future<u32> = Future::new();
        let g = f.then(|v| Ok(v + 1));
        f.fail(Fault::msg("upstream"));
        assert_eq!(g.wait().unwrap_err().to_string(), "upstream");
    }

    #[test]
    fn then_error_fails_downstream_only() {
        let f: Future<u32> = Future::new();
        let g = f.then(|_| Err::<u32, _>(Fault::msg("mapper")));
        f.resolve(1);
        assert_eq!(f.wait().unwrap(), 1);
        assert!(g.wait().is_err());
    }

    #[test]
    fn then_fut_adopts_the_inner_future() {
        let f: Future<u32> = Future::new();
        let inner: Future<u32> = Future::new();
        let inner_clone = inner.clone();
        let g = f.then_fut(move |v| inner_clone.then(move |w| Ok(v + w)));
        f.resolve(10);
        inner.resolve(32);
        assert_eq!(g.wait().unwrap(), 42);
    }

    #[test]
    fn adopt_chains_recursively() {
        let a: Future<u32> = Future::new();
        let b: Future<u32> = Future::new();
        let c: Future<u32> = Future::new();
        a.adopt(b.clone());
        b.adopt(c.clone());
        c.resolve(7);
        assert_eq!(a.wait().unwrap(), 7);
    }

    #[test]
    fn wait_timeout_raises_but_work_continues() {
        let f: Future<u32> = Future::new();
        let err = f.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
        f.resolve(8);
        assert_eq!(f.wait().unwrap(), 8);
    }

    #[test]
    fn run_on_pool_resolves() {
        let pool = WorkerPool::new(1);
        let f = run_on(&pool, || Ok(11u32));
        assert_eq!(f.wait().unwrap(), 11);
        pool.join();
    }

    #[test]
    fn prun_keeps_submission_order() {
        let pool = WorkerPool::new(4);
        let tasks: Vec<Box<dyn FnOnce() -> Result<u32, Fault> + Send>> = (0..8u32)
            .map(|i| {
                Box::new(move || {
                    std::thread::sleep(Duration::from_millis(u64::from(8 - i)));
                    Ok(i)
                }) as Box<dyn FnOnce() -> Result<u32, Fault> + Send>
            })
            .collect();
        let all = prun_on(&pool, tasks);
        assert_eq!(all.wait().unwrap(), (0..8).collect::<Vec<_>>());
        pool.join();
    }

    #[test]
    fn prun_aggregates_failures() {
        let pool = WorkerPool::new(2);
        let tasks: Vec<Box<dyn FnOnce() -> Result<u32, Fault> + Send>> = vec![
            Box::new(|| Ok(1)),
            Box::new(|| Err(Fault::msg("first"))),
            Box::new(|| Err(Fault::msg("second"))),
        ];
        let all = prun_on(&pool, tasks);
        let fault = all.wait().unwrap_err();
        assert_eq!(fault.fault_list().unwrap().len(), 2);
        pool.join();
    }

    #[test]
    fn prun_of_nothing_is_empty() {
        let pool = WorkerPool::new(1);
        let all: Future<Vec<u32>> = prun_on(&pool, Vec::new());
        assert_eq!(all.wait().unwrap(), Vec::<u32>::new());
        pool.join();
    }
}
