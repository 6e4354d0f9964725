//! Servant interfaces and the grid trait.
//!
//! These traits are the IDL of the system: what a replica exposes to its
//! peers, what the manager exposes to replicas, and what any activated
//! server exposes for online notification. Proxies implement the same
//! traits as the servants they stand for; the difference is that a proxy
//! call can fail with a transport tag (`NoEndpoint`, `ObjectNotExist`).

use std::sync::Arc;

use bytes::Bytes;
use galena_fabric::Future;
use galena_types::{Addr, CallError, MasterMap, NodeState, Priority, ShardId};

/// The master-election surface every replicated servant carries.
pub trait Replicated: Send + Sync {
    /// The replica's current priority vector.
    fn master_state(&self) -> Result<Priority, CallError>;
}

/// Receives replication updates asynchronously.
///
/// This is the callback-style RPC adapted to a future at the boundary: the
/// relay submits one update and watches the future for the ack that lets
/// its position advance.
pub trait UpdateSink: Send + Sync {
    fn begin_update(&self, msg: Bytes) -> Future<()>;
}

/// A data replica: the small-object store surface plus shard and peer
/// administration.
pub trait StoreApi: UpdateSink {
    // Client surface; served by the master, `NotMaster`/`NoShard` otherwise.
    fn read(&self, path: &str) -> Result<String, CallError>;
    fn write(&self, path: &str, data: &str) -> Result<(), CallError>;
    fn remove(&self, path: &str) -> Result<(), CallError>;
    fn list(&self, shard: &ShardId) -> Result<Vec<String>, CallError>;

    // Replica-local surface: answers from this replica's own state.
    fn read_rep(&self, path: &str) -> Result<String, CallError>;
    fn list_rep(&self, shard: &ShardId) -> Result<Vec<String>, CallError>;
    fn get_state(&self) -> Result<NodeState, CallError>;

    // Shard administration, driven by the manager.
    fn add_shard(&self, shard: &ShardId) -> Result<(), CallError>;
    fn remove_data(&self, shard: &ShardId) -> Result<(), CallError>;
    fn add_peer(&self, shard: &ShardId, addr: &Addr, sync: bool) -> Result<(), CallError>;
    fn remove_peer(&self, shard: &ShardId, addr: &Addr) -> Result<(), CallError>;
    fn peers(&self, shard: &ShardId) -> Result<Vec<Addr>, CallError>;
}

/// The cluster manager's control plane.
pub trait ManagerApi: Replicated {
    /// Registers a new replica with the group. Idempotent.
    fn register(&self, addr: &Addr) -> Result<(), CallError>;

    /// Removes a replica from the group; refused for the current master.
    fn remove_replica(&self, addr: &Addr) -> Result<(), CallError>;

    /// The freshly-computed master-per-shard map.
    fn get_masters(&self) -> Result<MasterMap, CallError>;
}

/// Online-notification receiver, present on every activated adapter.
pub trait AntennaApi: Send + Sync {
    /// One-way: the caller neither waits nor learns of failures.
    fn server_online(&self, server_id: &str);
}

/// Address resolution and replica-group queries: the face of the RPC
/// runtime the core consumes.
///
/// Proxy construction is lazy and never fails; a bad address surfaces as a
/// transport error at call time, mirroring how real RPC runtimes behave.
pub trait Grid: Send + Sync {
    fn store_proxy(&self, addr: &Addr) -> Arc<dyn StoreApi>;
    fn manager_proxy(&self, addr: &Addr) -> Arc<dyn ManagerApi>;
    fn antenna_proxy(&self, addr: &Addr) -> Arc<dyn AntennaApi>;

    /// Adapter activation: publishes a servant at an address. Group
    /// membership is derived from the address shape.
    fn provide_store(&self, addr: &Addr, servant: Arc<dyn StoreApi>);
    fn provide_manager(&self, addr: &Addr, servant: Arc<dyn ManagerApi>);
    fn provide_antenna(&self, addr: &Addr, servant: Arc<dyn AntennaApi>);

    /// The member addresses of a replica group. `refresh` bypasses any
    /// cached membership.
    fn replicas(&self, group: &Addr, refresh: bool) -> Result<Vec<Addr>, CallError>;

    /// Every adapter id currently known to the registry.
    fn adapter_ids(&self) -> Vec<String>;

    /// Whether the named server is currently active.
    fn server_active(&self, server_id: &str) -> bool;
}
