//! A typed collection of shards on one replica.
//!
//! The `DataNode` owns every shard of one data type under
//! `<data>/<node>/<type>/`. At startup it re-creates a shard object for
//! each `S<bits>` directory through the registered factory (bootstrapping
//! the all-keys shard `""` on a fresh node), assigns each an election
//! priority `[0, used_before, random]`, registers itself with the manager
//! once (guarded by the `.reg` marker file), and listens on the `online`
//! channel so relays toward a returning peer get kicked promptly.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use galena_fabric::Subscription;
use galena_replication::ShardCore;
use galena_rpc::{Env, ManagerApi};
use galena_types::{Addr, CallError, NodeState, Priority, ShardId, ShardState, key_hash};
use rand::Rng;

use crate::master::MasterRouter;

/// Marker file recording a completed manager registration.
const REG_MARKER: &str = ".reg";

/// A data-type shard as the node sees it: the replication core plus the
/// update hook the node routes incoming replication messages to.
pub trait Shard: Send + Sync + 'static {
    fn core(&self) -> &ShardCore;

    /// Applies a received replication message; must be the inverse of
    /// whatever the data type appends to its log.
    fn apply_update(&self, msg: &Bytes) -> Result<(), CallError>;
}

/// Builds shards of one data type and routes its messages.
pub trait ShardFactory: Send + Sync + 'static {
    type Shard: Shard;

    /// The data type's name; also its directory under the node's data
    /// root and the servant name in replica addresses.
    fn type_id(&self) -> &'static str;

    fn make_shard(&self, env: &Env, shard: &ShardId) -> Result<Arc<Self::Shard>, CallError>;

    /// Extracts the routing key from a replication message.
    fn route_key(&self, msg: &Bytes) -> Result<String, CallError>;
}

/// One shard plus its election priority.
pub struct ShardSlot<S> {
    pub shard: Arc<S>,
    priority: Mutex<Priority>,
}

impl<S> ShardSlot<S> {
    pub fn priority(&self) -> Priority {
        self.priority.lock().expect("priority lock poisoned").clone()
    }

    pub fn is_master(&self) -> bool {
        self.priority().is_master()
    }

    fn set_master(&self, is_master: bool) {
        self.priority
            .lock()
            .expect("priority lock poisoned")
            .set_master(is_master);
    }
}

/// A typed shard container; see the module docs.
pub struct DataNode<F: ShardFactory> {
    env: Env,
    factory: F,
    path: PathBuf,
    self_addr: Addr,
    shards: RwLock<BTreeMap<ShardId, Arc<ShardSlot<F::Shard>>>>,
    mgr: MasterRouter<dyn ManagerApi>,
    online_sub: Mutex<Option<Subscription>>,
}

impl<F: ShardFactory> DataNode<F> {
    /// Builds the node, scans its data directory for shards, and hooks up
    /// activation (manager registration, relay kicks) and the `online`
    /// channel.
    pub fn new(env: &Env, factory: F) -> Result<Arc<Self>, CallError> {
        let type_id = factory.type_id();
        let path = env.data_dir().join(type_id);
        fs::create_dir_all(&path).map_err(|e| CallError::Storage(e.to_string()))?;

        let server = env.server_name();
        let self_addr = Addr::new(format!(
            "{type_id}@{server}-{node}.{server}Rep",
            node = env.node_name()
        ));
        let mgr = MasterRouter::manager(Addr::new(format!("{type_id}@DataManagerGroup")));

        let node = Arc::new(Self {
            env: env.clone(),
            factory,
            path,
            self_addr,
            shards: RwLock::new(BTreeMap::new()),
            mgr,
            online_sub: Mutex::new(None),
        });
        node.init_shards()?;

        let weak = Arc::downgrade(&node);
        let sub = env.subscribe("online", move |server_id| {
            if let Some(node) = weak.upgrade() {
                node.handle_online(server_id);
            }
        });
        *node.online_sub.lock().expect("subscription lock poisoned") = Some(sub);

        let weak = Arc::downgrade(&node);
        env.on_activation(move |_| {
            if let Some(node) = weak.upgrade() {
                node.start_relays();
                node.register();
            }
        });

        Ok(node)
    }

    /// This replica's address for the node's data type.
    pub fn addr(&self) -> &Addr {
        &self.self_addr
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    fn init_shards(&self) -> Result<(), CallError> {
        let entries = fs::read_dir(&self.path).map_err(|e| CallError::Storage(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| CallError::Storage(e.to_string()))?;
            if let Some(sid) = entry
                .file_name()
                .to_str()
                .and_then(ShardId::from_dir_name)
            {
                self.add_shard(&sid)?;
            }
        }
        if self.shards.read().expect("shards lock poisoned").is_empty() {
            self.add_shard(&ShardId::root())?;
        }
        Ok(())
    }

    /// Creates (or re-opens) a shard. Idempotent. A shard that has never
    /// held data gets `used_before = 0`, losing elections to any replica
    /// that has.
    pub fn add_shard(&self, sid: &ShardId) -> Result<(), CallError> {
        {
            let shards = self.shards.read().expect("shards lock poisoned");
            if shards.contains_key(sid) {
                return Ok(());
            }
        }
        let shard = self.factory.make_shard(&self.env, sid)?;
        let used_before = i64::from(!shard.core().is_new());
        let priority = Priority::new(vec![
            0,
            used_before,
            rand::thread_rng().gen_range(0..i64::MAX),
        ]);
        self.shards
            .write()
            .expect("shards lock poisoned")
            .insert(sid.clone(), Arc::new(ShardSlot {
                shard,
                priority: Mutex::new(priority),
            }));
        Ok(())
    }

    /// Registers this replica with the manager, once. The `.reg` marker is
    /// written only after the manager acknowledges, so an interrupted
    /// registration retries on the next activation — and the manager's
    /// `register` is idempotent, so a duplicate is harmless.
    pub fn register(self: Arc<Self>) {
        let marker = self.path.join(REG_MARKER);
        if marker.exists() {
            return;
        }
        let node = Arc::clone(&self);
        self.env.submit(move || {
            match node.mgr.call(&node.env, |m| m.register(&node.self_addr)) {
                Ok(()) => {
                    if let Err(e) = fs::write(&marker, b"") {
                        tracing::warn!(error = %e, "cannot write registration marker");
                    }
                    tracing::info!(addr = %node.self_addr, "registered with manager");
                }
                Err(e) => {
                    tracing::warn!(addr = %node.self_addr, error = %e, "registration failed; will retry on next activation");
                }
            }
        });
    }

    /// Kicks every relay of every shard; called on activation so lagging
    /// peers catch up without waiting for the next mutation.
    pub fn start_relays(&self) {
        for slot in self.slots() {
            slot.shard.core().start_relays();
        }
    }

    // ------------------------------------------------------------------
    // Shard lookup and mastership
    // ------------------------------------------------------------------

    /// The shard id owning `key`, if this replica has it.
    pub fn shard_for(&self, key: &str) -> Option<ShardId> {
        let hash = key_hash(key);
        self.shards
            .read()
            .expect("shards lock poisoned")
            .keys()
            .find(|sid| sid.covers(hash))
            .cloned()
    }

    pub fn slot(&self, sid: &ShardId) -> Result<Arc<ShardSlot<F::Shard>>, CallError> {
        self.shards
            .read()
            .expect("shards lock poisoned")
            .get(sid)
            .cloned()
            .ok_or_else(|| CallError::NoShard {
                path: None,
                shard: Some(sid.clone()),
            })
    }

    fn slots(&self) -> Vec<Arc<ShardSlot<F::Shard>>> {
        self.shards
            .read()
            .expect("shards lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// The local shard for `key`, provided this replica is its master.
    ///
    /// Fast path: the shard already carries `priority[0] == 1`. Otherwise
    /// the manager's master map is fetched, every local shard's master
    /// flag is refreshed from it, and the answer is re-checked.
    pub fn master_slot_for_key(&self, key: &str) -> Result<Arc<ShardSlot<F::Shard>>, CallError> {
        let sid = self
            .shard_for(key)
            .ok_or_else(|| CallError::no_shard_for(key))?;
        self.master_slot(&sid)
    }

    /// The local shard `sid`, provided this replica is its master.
    pub fn master_slot(&self, sid: &ShardId) -> Result<Arc<ShardSlot<F::Shard>>, CallError> {
        let slot = self.slot(sid)?;
        if slot.is_master() {
            return Ok(slot);
        }
        let masters = self.mgr.call(&self.env, |m| m.get_masters())?;
        self.apply_master_map(&masters);
        if slot.is_master() {
            Ok(slot)
        } else {
            Err(CallError::NoShard {
                path: None,
                shard: Some(sid.clone()),
            })
        }
    }

    /// Refreshes every local shard's master flag from the published map:
    /// this node is master for exactly the shards the map places on it.
    fn apply_master_map(&self, masters: &galena_types::MasterMap) {
        let node_name = self.env.node_name();
        let shards = self.shards.read().expect("shards lock poisoned");
        for (sid, slot) in shards.iter() {
            let is_master = masters.get(sid).is_some_and(|addr| addr.node() == node_name);
            slot.set_master(is_master);
        }
    }

    // ------------------------------------------------------------------
    // Published state and administration
    // ------------------------------------------------------------------

    /// The replication state of this replica, for publication.
    pub fn get_state(&self) -> Result<NodeState, CallError> {
        let mut shards = BTreeMap::new();
        for (sid, slot) in self.shards.read().expect("shards lock poisoned").iter() {
            let replicas = slot
                .shard
                .core()
                .peers()
                .map_err(|e| CallError::Storage(e.to_string()))?;
            shards.insert(
                sid.clone(),
                ShardState {
                    replicas,
                    priority: slot.priority(),
                },
            );
        }
        Ok(NodeState { shards })
    }

    /// [`Self::get_state`], first making sure a registration is underway
    /// for a replica that never completed one.
    pub fn get_state_registered(self: Arc<Self>) -> Result<NodeState, CallError> {
        Arc::clone(&self).register();
        self.get_state()
    }

    /// Wipes a shard's data and retires the shard object.
    pub fn remove_data(&self, sid: &ShardId) -> Result<(), CallError> {
        let slot = {
            self.shards
                .write()
                .expect("shards lock poisoned")
                .remove(sid)
                .ok_or_else(|| CallError::NoShard {
                    path: None,
                    shard: Some(sid.clone()),
                })?
        };
        slot.shard
            .core()
            .remove_data()
            .map_err(|e| CallError::Storage(e.to_string()))
    }

    pub fn add_peer(&self, sid: &ShardId, addr: &Addr, sync: bool) -> Result<(), CallError> {
        self.slot(sid)?
            .shard
            .core()
            .add_peer(addr, sync)
            .map_err(|e| CallError::Storage(e.to_string()))
    }

    pub fn remove_peer(&self, sid: &ShardId, addr: &Addr) -> Result<(), CallError> {
        self.slot(sid)?
            .shard
            .core()
            .remove_peer(addr)
            .map_err(|e| CallError::Storage(e.to_string()))
    }

    pub fn peers(&self, sid: &ShardId) -> Result<Vec<Addr>, CallError> {
        self.slot(sid)?
            .shard
            .core()
            .peers()
            .map_err(|e| CallError::Storage(e.to_string()))
    }

    /// Applies a received replication message, routed by its key.
    pub fn update(&self, msg: &Bytes) -> Result<(), CallError> {
        let key = self.factory.route_key(msg)?;
        let sid = self
            .shard_for(&key)
            .ok_or_else(|| CallError::no_shard_for(&key))?;
        self.slot(&sid)?.shard.apply_update(msg)
    }

    /// A peer of this node's group came online: kick any relay targeting
    /// it, on every shard.
    fn handle_online(&self, server_id: &str) {
        let Some((server, _)) = server_id.split_once('-') else {
            return;
        };
        if server != self.env.server_name() {
            return;
        }
        let addr = Addr::new(format!(
            "{type_id}@{server_id}.{server}Rep",
            type_id = self.factory.type_id()
        ));
        for slot in self.slots() {
            slot.shard.core().on_online(&addr);
        }
    }
}
