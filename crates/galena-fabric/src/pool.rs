//! A bounded pool of worker threads with a pluggable queue policy.
//!
//! One pool per process (held by the `Env`) acts as the serialization point
//! for writes and persistence; relays borrow it for background listing
//! tasks. Submitting work never blocks. A worker thread is spawned lazily
//! when there is more queued work than idle workers and the pool is below
//! its bound.
//!
//! Task outcomes are discarded: a panicking task is logged and swallowed,
//! and never takes its worker down. Callers that want a result pair the
//! pool with a [`Future`](crate::Future) via [`run_on`](crate::run_on).

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Order in which queued jobs are handed to workers.
///
/// The default is plain first-in first-out. A shared pool with a fairness
/// requirement can substitute its own policy.
pub trait QueuePolicy: Send {
    fn put(&mut self, job: Job);
    fn get(&mut self) -> Option<Job>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First-in first-out queue policy.
#[derive(Default)]
pub struct Fifo {
    queue: VecDeque<Job>,
}

impl QueuePolicy for Fifo {
    fn put(&mut self, job: Job) {
        self.queue.push_back(job);
    }

    fn get(&mut self) -> Option<Job> {
        self.queue.pop_front()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

struct PoolState {
    queue: Box<dyn QueuePolicy>,
    workers: Vec<JoinHandle<()>>,
    idle: usize,
    done: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    cond: Condvar,
    max_workers: usize,
}

/// A bounded worker-thread pool; see the module docs.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// A pool of at most `max_workers` threads with the FIFO policy.
    pub fn new(max_workers: usize) -> Self {
        Self::with_queue(max_workers, Box::new(Fifo::default()))
    }

    /// A pool with a caller-supplied queue policy.
    pub fn with_queue(max_workers: usize, queue: Box<dyn QueuePolicy>) -> Self {
        assert!(max_workers > 0, "worker pool needs at least one worker");
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue,
                    workers: Vec::new(),
                    idle: 0,
                    done: false,
                }),
                cond: Condvar::new(),
                max_workers,
            }),
        }
    }

    /// Enqueues a job, spawning a worker if all existing ones are busy and
    /// the pool is below its bound.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        state.queue.put(Box::new(job));
        if state.workers.len() < self.inner.max_workers && state.idle < state.queue.len() {
            let worker = self.spawn_worker(state.workers.len());
            state.workers.push(worker);
        }
        self.inner.cond.notify_all();
    }

    /// Blocks until the queue is empty and every worker is idle.
    ///
    /// This is the barrier tests use to wait for write/replication work to
    /// settle before asserting on replica state.
    pub fn flush(&self) {
        let mut state = self.lock();
        while !state.queue.is_empty() || state.idle < state.workers.len() {
            state = self.inner.cond.wait(state).expect("pool lock poisoned");
        }
    }

    /// Asks workers to drain the queue and exit. Does not block.
    pub fn release(&self) {
        let mut state = self.lock();
        state.done = true;
        self.inner.cond.notify_all();
    }

    /// Releases the pool and waits for every worker to finish.
    pub fn join(&self) {
        self.release();
        let workers = {
            let mut state = self.lock();
            std::mem::take(&mut state.workers)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().expect("pool lock poisoned")
    }

    fn spawn_worker(&self, index: usize) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name(format!("galena-worker-{index}"))
            .spawn(move || worker_loop(&inner))
            .expect("failed to spawn worker thread")
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut state = inner.state.lock().expect("pool lock poisoned");
            loop {
                if let Some(job) = state.queue.get() {
                    break job;
                }
                if state.done {
                    return;
                }
                state.idle += 1;
                inner.cond.notify_all();
                state = inner.cond.wait(state).expect("pool lock poisoned");
                state.idle -= 1;
            }
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let what = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(panic = %what, "worker task panicked");
        }

        // Wake any flush() waiting for the pool to go quiet.
        let state = inner.state.lock().expect("pool lock poisoned");
        if state.queue.is_empty() {
            inner.cond.notify_all();
        }
        drop(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.flush();
        assert_eq!(count.load(Ordering::SeqCst), 16);
        pool.join();
    }

    #[test]
    fn single_worker_serializes() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = Arc::clone(&order);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(1));
                order.lock().unwrap().push(i);
            });
        }
        pool.flush();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
        pool.join();
    }

    #[test]
    fn worker_count_stays_bounded() {
        let pool = WorkerPool::new(3);
        for _ in 0..32 {
            pool.submit(|| std::thread::sleep(Duration::from_millis(2)));
        }
        {
            let state = pool.lock();
            assert!(state.workers.len() <= 3);
        }
        pool.join();
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = WorkerPool::new(1);
        pool.submit(|| panic!("task gone wrong"));
        let after = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&after);
        pool.submit(move || {
            a.store(1, Ordering::SeqCst);
        });
        pool.flush();
        assert_eq!(after.load(Ordering::SeqCst), 1);
        pool.join();
    }

    #[test]
    fn join_drains_remaining_work() {
        let pool = WorkerPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(1));
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn flush_on_idle_pool_returns() {
        let pool = WorkerPool::new(1);
        pool.flush();
        pool.join();
    }
}
