//! # galena-client: the client-side entry point
//!
//! A [`DataClient`] holds a replica-group address and two caches: the
//! shard map (which shard ids exist, and each replica's state for them)
//! and the elected master per shard. Operations hash the key, find the
//! owning shard by bit-string prefix, and call the cached master.
//!
//! When a call comes back with a stale-route tag (`NotMaster`, `NoShard`,
//! a dead endpoint), the client re-queries every replica for its shard
//! map, rebuilds both caches, and retries exactly once. Anything else —
//! including a data-level `NotFound` — is surfaced unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use galena_rpc::{Env, StoreApi};
use galena_types::{Addr, CallError, Priority, ShardId, hash_bits, key_hash};

#[derive(Default)]
struct ClientState {
    /// shard id -> replica address -> that replica's priority for it.
    shards: Option<HashMap<ShardId, HashMap<Addr, Priority>>>,
    /// Elected master per shard, derived lazily from `shards`.
    masters: HashMap<ShardId, Addr>,
}

/// Master-aware client for a replicated store; see the module docs.
pub struct DataClient {
    env: Env,
    group: Addr,
    state: Mutex<ClientState>,
}

impl DataClient {
    /// A client for the replica group at `group` (e.g. `file@SmallFSGroup`).
    pub fn new(env: &Env, group: Addr) -> Self {
        Self {
            env: env.clone(),
            group,
            state: Mutex::new(ClientState::default()),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub fn read(&self, key: &str) -> Result<String, CallError> {
        self.call(key, |proxy| proxy.read(key))
    }

    pub fn write(&self, key: &str, data: &str) -> Result<(), CallError> {
        self.call(key, |proxy| proxy.write(key, data))
    }

    pub fn remove(&self, key: &str) -> Result<(), CallError> {
        self.call(key, |proxy| proxy.remove(key))
    }

    pub fn list(&self, shard: &ShardId) -> Result<Vec<String>, CallError> {
        self.call_by_shard(shard, |proxy| proxy.list(shard))
    }

    /// Calls `op` on the master for `key`'s shard, refreshing the caches
    /// and retrying once if the route proves stale.
    pub fn call<T>(
        &self,
        key: &str,
        op: impl Fn(&Arc<dyn StoreApi>) -> Result<T, CallError>,
    ) -> Result<T, CallError> {
        let shard = self.shard_for(key)?;
        self.call_by_shard(&shard, op)
    }

    /// Like [`Self::call`], with the shard already known.
    pub fn call_by_shard<T>(
        &self,
        shard: &ShardId,
        op: impl Fn(&Arc<dyn StoreApi>) -> Result<T, CallError>,
    ) -> Result<T, CallError> {
        let proxy = self.env.store_proxy(&self.master_addr(shard)?);
        match op(&proxy) {
            Err(e) if e.is_stale_route() => {
                tracing::debug!(shard = %shard, error = %e, "stale route, refreshing");
                self.refresh()?;
                let proxy = self.env.store_proxy(&self.master_addr(shard)?);
                op(&proxy)
            }
            outcome => outcome,
        }
    }

    // ------------------------------------------------------------------
    // Shard and master caches
    // ------------------------------------------------------------------

    /// The shard owning `key`: the shortest known prefix of the key
    /// hash's little-endian bit string.
    pub fn shard_for(&self, key: &str) -> Result<ShardId, CallError> {
        self.ensure_loaded()?;
        let bits = hash_bits(key_hash(key));
        let state = self.lock();
        let known = state.shards.as_ref().expect("loaded above");
        for len in 0..=8 {
            let candidate = ShardId::parse(&bits[..len]).expect("bit string is clean");
            if known.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(CallError::no_shard_for(key))
    }

    /// Re-queries every replica for its shard map and rebuilds both
    /// caches. Unreachable replicas are skipped.
    pub fn refresh(&self) -> Result<(), CallError> {
        let mut shards: HashMap<ShardId, HashMap<Addr, Priority>> = HashMap::new();
        for addr in self.env.replicas(&self.group, true)? {
            match self.env.store_proxy(&addr).get_state() {
                Ok(state) => {
                    for (sid, shard_state) in state.shards {
                        shards
                            .entry(sid)
                            .or_default()
                            .insert(addr.clone(), shard_state.priority);
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "replica unreachable, skipping");
                }
            }
        }
        let mut state = self.lock();
        state.shards = Some(shards);
        state.masters.clear();
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<(), CallError> {
        if self.lock().shards.is_none() {
            self.refresh()?;
        }
        Ok(())
    }

    /// The elected master for `shard`: the replica whose priority vector
    /// is lexicographically highest.
    fn master_addr(&self, shard: &ShardId) -> Result<Addr, CallError> {
        self.ensure_loaded()?;
        let mut state = self.lock();
        if let Some(addr) = state.masters.get(shard) {
            return Ok(addr.clone());
        }
        let replicas = state
            .shards
            .as_ref()
            .expect("loaded above")
            .get(shard)
            .ok_or(CallError::NoShard {
                path: None,
                shard: Some(shard.clone()),
            })?;
        let (addr, _) = replicas
            .iter()
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .ok_or(CallError::NoShard {
                path: None,
                shard: Some(shard.clone()),
            })?;
        let addr = addr.clone();
        state.masters.insert(shard.clone(), addr.clone());
        Ok(addr)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().expect("client lock poisoned")
    }
}
