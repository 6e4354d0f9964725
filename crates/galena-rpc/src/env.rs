//! The per-process environment.
//!
//! One [`Env`] is built at process start and threaded through every
//! component: the grid handle, the data root, the server id, the worker
//! pool that serializes writes and persistence, the event bus, and the
//! activation hook that fires once the server's adapters are up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use galena_fabric::{Fault, Future, Publisher, Subscription, WorkerPool, run_on};
use galena_types::{Addr, CallError};

use crate::api::{AntennaApi, Grid, ManagerApi, StoreApi, UpdateSink};

type ActivationHook = Box<dyn FnOnce(&Env) + Send>;

struct EnvInner {
    grid: Arc<dyn Grid>,
    data_dir: PathBuf,
    server_id: String,
    pool: WorkerPool,
    publisher: Publisher,
    activation: Mutex<Vec<ActivationHook>>,
    activated: AtomicBool,
}

/// Ambient process resources; cloning shares them.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl Env {
    /// Builds an environment.
    ///
    /// `server_id` has the form `<group>-<node>`; the node's data lives
    /// under `<data_root>/<node>`.
    pub fn new(
        grid: Arc<dyn Grid>,
        data_root: impl Into<PathBuf>,
        server_id: impl Into<String>,
        pool_size: usize,
    ) -> Self {
        let server_id = server_id.into();
        let node = server_id
            .split_once('-')
            .map_or(server_id.as_str(), |(_, node)| node)
            .to_string();
        Self {
            inner: Arc::new(EnvInner {
                grid,
                data_dir: data_root.into().join(node),
                server_id,
                pool: WorkerPool::new(pool_size),
                publisher: Publisher::new(),
                activation: Mutex::new(Vec::new()),
                activated: AtomicBool::new(false),
            }),
        }
    }

    pub fn grid(&self) -> &Arc<dyn Grid> {
        &self.inner.grid
    }

    /// This node's subtree of the data root.
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// The process-level server id, `<group>-<node>`.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// The group part of the server id.
    pub fn server_name(&self) -> &str {
        self.inner
            .server_id
            .split_once('-')
            .map_or(self.inner.server_id.as_str(), |(name, _)| name)
    }

    /// The node part of the server id.
    pub fn node_name(&self) -> &str {
        self.inner
            .server_id
            .split_once('-')
            .map_or(self.inner.server_id.as_str(), |(_, node)| node)
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    /// Submits fire-and-forget work to the pool.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.pool.submit(f);
    }

    /// Runs `f` on the pool, returning a future for its outcome.
    pub fn run<T: Clone + Send + 'static>(
        &self,
        f: impl FnOnce() -> Result<T, Fault> + Send + 'static,
    ) -> Future<T> {
        run_on(&self.inner.pool, f)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn notify(&self, channel: &str, payload: &str) {
        self.inner.publisher.notify(channel, payload);
    }

    #[must_use = "dropping the Subscription immediately unsubscribes"]
    pub fn subscribe(
        &self,
        channel: &str,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.publisher.subscribe(channel, handler)
    }

    /// Registers a hook to run once this server is activated. Runs
    /// immediately if activation already happened.
    pub fn on_activation(&self, hook: impl FnOnce(&Env) + Send + 'static) {
        if self.inner.activated.load(Ordering::SeqCst) {
            hook(self);
            return;
        }
        let mut hooks = self.inner.activation.lock().expect("activation lock poisoned");
        // Re-check under the lock so a hook cannot be stranded by a
        // concurrent activate().
        if self.inner.activated.load(Ordering::SeqCst) {
            drop(hooks);
            hook(self);
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Marks the server active and runs the queued activation hooks.
    pub fn activate(&self) {
        let hooks = {
            let mut hooks = self.inner.activation.lock().expect("activation lock poisoned");
            self.inner.activated.store(true, Ordering::SeqCst);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook(self);
        }
    }

    // ------------------------------------------------------------------
    // Grid shortcuts
    // ------------------------------------------------------------------

    pub fn replicas(&self, group: &Addr, refresh: bool) -> Result<Vec<Addr>, CallError> {
        self.inner.grid.replicas(group, refresh)
    }

    pub fn store_proxy(&self, addr: &Addr) -> Arc<dyn StoreApi> {
        self.inner.grid.store_proxy(addr)
    }

    pub fn manager_proxy(&self, addr: &Addr) -> Arc<dyn ManagerApi> {
        self.inner.grid.manager_proxy(addr)
    }

    pub fn antenna_proxy(&self, addr: &Addr) -> Arc<dyn AntennaApi> {
        self.inner.grid.antenna_proxy(addr)
    }

    /// The update-sink view of a store replica, for relays.
    pub fn update_sink(&self, addr: &Addr) -> Arc<dyn UpdateSink> {
        self.inner.grid.store_proxy(addr)
    }
}
