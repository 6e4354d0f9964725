//! # galena-fabric: the asynchronous execution fabric
//!
//! The concurrency primitives every other Galena crate is built on:
//!
//! - [`Future`] — a single-assignment deferred result with callbacks,
//!   chaining and timed wait
//! - [`Fault`] — the clonable, type-erased error a failed future carries
//! - [`WorkerPool`] — a bounded pool of worker threads with a pluggable
//!   queue policy
//! - [`Publisher`] — a named-channel event bus with scoped subscriptions
//!
//! The model is plain parallel threads with cooperative futures: any method
//! returning a [`Future`] may complete on another thread, and the only
//! blocking primitives in the system are [`Future::wait`] and the pool's
//! internal condition variable.

pub mod fault;
pub mod future;
pub mod pool;
pub mod publisher;

pub use fault::{Fault, FaultList};
pub use future::{Future, capture_fault_traces, prun_on, run_on, set_default_wait_timeout};
pub use pool::{Fifo, Job, QueuePolicy, WorkerPool};
pub use publisher::{Publisher, Subscription};
