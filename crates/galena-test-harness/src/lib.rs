//! # galena-test-harness: the in-memory loopback grid
//!
//! A [`LoopGrid`] implements the RPC boundary without a network: servants
//! register under their addresses, proxies dispatch to them synchronously
//! in the caller's thread, and whole servers can be disabled to simulate
//! crashes and partitions — a disabled server's proxies fail with
//! `NoEndpoint`, exactly as a real runtime reports a dead replica.
//!
//! Replica-group membership is derived from address shape: providing a
//! servant at `file@SmallFS-node2.SmallFSRep` enrolls it in
//! `file@SmallFSGroup`.
//!
//! Test-only; production deployments back `galena_rpc::Grid` with a real
//! RPC runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use galena_fabric::Future;
use galena_rpc::{AntennaApi, Grid, ManagerApi, StoreApi, UpdateSink, fault_from_call};
use galena_types::{Addr, CallError, MasterMap, NodeState, Priority, ShardId};

#[derive(Default)]
struct GridState {
    stores: BTreeMap<String, Arc<dyn StoreApi>>,
    managers: BTreeMap<String, Arc<dyn ManagerApi>>,
    antennas: BTreeMap<String, Arc<dyn AntennaApi>>,
    groups: BTreeMap<String, BTreeSet<Addr>>,
    disabled: BTreeSet<String>,
}

impl GridState {
    fn enroll(&mut self, addr: &Addr) {
        // file@SmallFS-node2.SmallFSRep -> file@SmallFSGroup
        let adapter = addr.adapter();
        if let Some((_, rep)) = adapter.split_once('.')
            && let Some(base) = rep.strip_suffix("Rep")
        {
            let group = format!("{}@{base}Group", addr.name());
            self.groups.entry(group).or_default().insert(addr.clone());
        }
    }

    fn check_reachable(&self, addr: &Addr, present: bool) -> Result<(), CallError> {
        let server = addr.server_id();
        if self.disabled.contains(server) {
            return Err(CallError::NoEndpoint { addr: addr.clone() });
        }
        let known = self.stores.keys().chain(self.managers.keys()).any(|a| {
            Addr::new(a.as_str()).server_id() == server
        });
        if !known {
            return Err(CallError::NoEndpoint { addr: addr.clone() });
        }
        if !present {
            return Err(CallError::ObjectNotExist { addr: addr.clone() });
        }
        Ok(())
    }
}

/// The in-memory grid; see the module docs. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct LoopGrid {
    state: Arc<Mutex<GridState>>,
}

impl LoopGrid {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GridState> {
        self.state.lock().expect("grid lock poisoned")
    }

    /// Takes the server offline: its proxies fail with `NoEndpoint`, its
    /// antenna goes quiet, and group queries still list it (membership is
    /// registry state, not liveness).
    pub fn disable_server(&self, server_id: &str) {
        self.lock().disabled.insert(server_id.to_string());
    }

    /// Brings a disabled server back. The caller is responsible for the
    /// online broadcast a real activation would perform.
    pub fn enable_server(&self, server_id: &str) {
        self.lock().disabled.remove(server_id);
    }

    pub fn is_disabled(&self, server_id: &str) -> bool {
        self.lock().disabled.contains(server_id)
    }

    fn resolve_store(&self, addr: &Addr) -> Result<Arc<dyn StoreApi>, CallError> {
        let state = self.lock();
        let servant = state.stores.get(addr.as_str()).cloned();
        state.check_reachable(addr, servant.is_some())?;
        Ok(servant.expect("presence checked"))
    }

    fn resolve_manager(&self, addr: &Addr) -> Result<Arc<dyn ManagerApi>, CallError> {
        let state = self.lock();
        let servant = state.managers.get(addr.as_str()).cloned();
        state.check_reachable(addr, servant.is_some())?;
        Ok(servant.expect("presence checked"))
    }

    fn resolve_antenna(&self, addr: &Addr) -> Result<Arc<dyn AntennaApi>, CallError> {
        let state = self.lock();
        let servant = state.antennas.get(addr.as_str()).cloned();
        state.check_reachable(addr, servant.is_some())?;
        Ok(servant.expect("presence checked"))
    }
}

impl Grid for LoopGrid {
    fn store_proxy(&self, addr: &Addr) -> Arc<dyn StoreApi> {
        Arc::new(StoreProxy {
            grid: self.clone(),
            addr: addr.clone(),
        })
    }

    fn manager_proxy(&self, addr: &Addr) -> Arc<dyn ManagerApi> {
        Arc::new(ManagerProxy {
            grid: self.clone(),
            addr: addr.clone(),
        })
    }

    fn antenna_proxy(&self, addr: &Addr) -> Arc<dyn AntennaApi> {
        Arc::new(AntennaProxy {
            grid: self.clone(),
            addr: addr.clone(),
        })
    }

    fn provide_store(&self, addr: &Addr, servant: Arc<dyn StoreApi>) {
        let mut state = self.lock();
        state.stores.insert(addr.as_str().to_string(), servant);
        state.enroll(addr);
    }

    fn provide_manager(&self, addr: &Addr, servant: Arc<dyn ManagerApi>) {
        let mut state = self.lock();
        state.managers.insert(addr.as_str().to_string(), servant);
        state.enroll(addr);
    }

    fn provide_antenna(&self, addr: &Addr, servant: Arc<dyn AntennaApi>) {
        self.lock()
            .antennas
            .insert(addr.as_str().to_string(), servant);
    }

    fn replicas(&self, group: &Addr, _refresh: bool) -> Result<Vec<Addr>, CallError> {
        Ok(self
            .lock()
            .groups
            .get(group.as_str())
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn adapter_ids(&self) -> Vec<String> {
        let state = self.lock();
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for addr in state
            .stores
            .keys()
            .chain(state.managers.keys())
            .chain(state.antennas.keys())
        {
            ids.insert(Addr::new(addr.as_str()).adapter().to_string());
        }
        ids.into_iter().collect()
    }

    fn server_active(&self, server_id: &str) -> bool {
        let state = self.lock();
        if state.disabled.contains(server_id) {
            return false;
        }
        state
            .stores
            .keys()
            .chain(state.managers.keys())
            .any(|a| Addr::new(a.as_str()).server_id() == server_id)
    }
}

// ============================================================================
// Proxies
// ============================================================================

struct StoreProxy {
    grid: LoopGrid,
    addr: Addr,
}

impl UpdateSink for StoreProxy {
    fn begin_update(&self, msg: Bytes) -> Future<()> {
        match self.grid.resolve_store(&self.addr) {
            Ok(servant) => servant.begin_update(msg),
            Err(e) => Future::failed(fault_from_call(e)),
        }
    }
}

impl StoreApi for StoreProxy {
    fn read(&self, path: &str) -> Result<String, CallError> {
        self.grid.resolve_store(&self.addr)?.read(path)
    }

    fn write(&self, path: &str, data: &str) -> Result<(), CallError> {
        self.grid.resolve_store(&self.addr)?.write(path, data)
    }

    fn remove(&self, path: &str) -> Result<(), CallError> {
        self.grid.resolve_store(&self.addr)?.remove(path)
    }

    fn list(&self, shard: &ShardId) -> Result<Vec<String>, CallError> {
        self.grid.resolve_store(&self.addr)?.list(shard)
    }

    fn read_rep(&self, path: &str) -> Result<String, CallError> {
        self.grid.resolve_store(&self.addr)?.read_rep(path)
    }

    fn list_rep(&self, shard: &ShardId) -> Result<Vec<String>, CallError> {
        self.grid.resolve_store(&self.addr)?.list_rep(shard)
    }

    fn get_state(&self) -> Result<NodeState, CallError> {
        self.grid.resolve_store(&self.addr)?.get_state()
    }

    fn add_shard(&self, shard: &ShardId) -> Result<(), CallError> {
        self.grid.resolve_store(&self.addr)?.add_shard(shard)
    }

    fn remove_data(&self, shard: &ShardId) -> Result<(), CallError> {
        self.grid.resolve_store(&self.addr)?.remove_data(shard)
    }

    fn add_peer(&self, shard: &ShardId, addr: &Addr, sync: bool) -> Result<(), CallError> {
        self.grid
            .resolve_store(&self.addr)?
            .add_peer(shard, addr, sync)
    }

    fn remove_peer(&self, shard: &ShardId, addr: &Addr) -> Result<(), CallError> {
        self.grid.resolve_store(&self.addr)?.remove_peer(shard, addr)
    }

    fn peers(&self, shard: &ShardId) -> Result<Vec<Addr>, CallError> {
        self.grid.resolve_store(&self.addr)?.peers(shard)
    }
}

struct ManagerProxy {
    grid: LoopGrid,
    addr: Addr,
}

impl galena_rpc::Replicated for ManagerProxy {
    fn master_state(&self) -> Result<Priority, CallError> {
        self.grid.resolve_manager(&self.addr)?.master_state()
    }
}

impl ManagerApi for ManagerProxy {
    fn register(&self, addr: &Addr) -> Result<(), CallError> {
        self.grid.resolve_manager(&self.addr)?.register(addr)
    }

    fn remove_replica(&self, addr: &Addr) -> Result<(), CallError> {
        self.grid.resolve_manager(&self.addr)?.remove_replica(addr)
    }

    fn get_masters(&self) -> Result<MasterMap, CallError> {
        self.grid.resolve_manager(&self.addr)?.get_masters()
    }
}

struct AntennaProxy {
    grid: LoopGrid,
    addr: Addr,
}

impl AntennaApi for AntennaProxy {
    fn server_online(&self, server_id: &str) {
        // One-way semantics: failures are logged, never surfaced.
        match self.grid.resolve_antenna(&self.addr) {
            Ok(servant) => servant.server_online(server_id),
            Err(e) => {
                tracing::debug!(addr = %self.addr, error = %e, "dropping one-way call");
            }
        }
    }
}
