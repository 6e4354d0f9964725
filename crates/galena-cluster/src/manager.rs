//! The cluster manager: a master-elected control-plane servant.
//!
//! The manager group's master registers new replicas, links and unlinks
//! peer relays across the data group, and publishes the master-per-shard
//! map that replicas and clients route by. Registration is idempotent:
//! a replica already linked everywhere comes out unchanged, which is also
//! what makes a half-registered replica safe to retry.

use std::collections::BTreeMap;
use std::sync::Arc;

use galena_rpc::{Env, ManagerApi, Replicated};
use galena_types::{Addr, CallError, MasterMap, NodeState, Priority, ShardId};

use crate::master::MasterOrSlave;

/// The control-plane servant; see the module docs.
pub struct DataManager {
    env: Env,
    mos: MasterOrSlave,
    data_group: Addr,
}

impl DataManager {
    /// A manager for the replicas of `data_group` (e.g.
    /// `file@SmallFSGroup`), electing within `<type>@DataManagerGroup`.
    pub fn new(env: &Env, data_group: Addr) -> Arc<Self> {
        let group = Addr::new(format!("{}@DataManagerGroup", data_group.name()));
        Arc::new(Self {
            env: env.clone(),
            mos: MasterOrSlave::manager(env, group),
            data_group,
        })
    }

    /// Builds the manager and publishes it on this node's adapter.
    pub fn serve(env: &Env, data_group: Addr) -> Arc<Self> {
        let manager = Self::new(env, data_group);
        let addr = manager.mos.self_addr().clone();
        env.grid().provide_manager(&addr, manager.clone());
        manager
    }

    pub fn addr(&self) -> &Addr {
        self.mos.self_addr()
    }

    /// Fetches the current state of every reachable replica in the data
    /// group, freshly. `exclude` drops one address from the result (used
    /// to keep a registrant out of its own master computation).
    fn group_states(&self, exclude: Option<&Addr>) -> Result<Vec<(Addr, NodeState)>, CallError> {
        let mut states = Vec::new();
        for addr in self.env.replicas(&self.data_group, true)? {
            if Some(&addr) == exclude {
                continue;
            }
            match self.env.store_proxy(&addr).get_state() {
                Ok(state) => states.push((addr, state)),
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "replica unreachable, skipping");
                }
            }
        }
        Ok(states)
    }

    /// Per shard, the address whose priority vector is maximal.
    fn masters_from(states: &[(Addr, NodeState)]) -> MasterMap {
        let mut best: BTreeMap<ShardId, (Addr, Priority)> = BTreeMap::new();
        for (addr, state) in states {
            for (sid, shard_state) in &state.shards {
                let better = best
                    .get(sid)
                    .is_none_or(|(_, p)| shard_state.priority > *p);
                if better {
                    best.insert(sid.clone(), (addr.clone(), shard_state.priority.clone()));
                }
            }
        }
        best.into_iter().map(|(sid, (addr, _))| (sid, addr)).collect()
    }

    /// Links `addr` into `sid`'s replica set, bi-directionally.
    ///
    /// Initial sync flows only from the current master (`sync = true` on
    /// that one edge); every other replica registers the newcomer in
    /// `REPLICATING` so future mutations propagate. Unreachable replicas
    /// are skipped; their links heal on a later (idempotent) register.
    fn add_replica(
        &self,
        sid: &ShardId,
        addr: &Addr,
        existing: &[(Addr, NodeState)],
    ) -> Result<(), CallError> {
        let owners: Vec<(Addr, Priority)> = existing
            .iter()
            .filter_map(|(a, state)| {
                state
                    .shards
                    .get(sid)
                    .map(|s| (a.clone(), s.priority.clone()))
            })
            .collect();
        let Some((master, _)) = crate::master::choose_master(owners) else {
            // First replica of this shard; nothing to link.
            return Ok(());
        };

        let mut sinks = self.env.store_proxy(&master).peers(sid)?;
        sinks.push(master.clone());
        if sinks.contains(addr) {
            tracing::debug!(shard = %sid, addr = %addr, "replica already linked");
            return Ok(());
        }

        let newcomer = self.env.store_proxy(addr);
        for peer in &sinks {
            let sync = *peer == master;
            if let Err(e) = self.env.store_proxy(peer).add_peer(sid, addr, sync) {
                if e.is_stale_route() {
                    tracing::warn!(shard = %sid, peer = %peer, error = %e, "peer unreachable, link deferred");
                    continue;
                }
                return Err(e);
            }
            if let Err(e) = newcomer.add_peer(sid, peer, false) {
                return Err(e);
            }
        }
        tracing::info!(shard = %sid, addr = %addr, master = %master, "replica linked");
        Ok(())
    }
}

impl Replicated for DataManager {
    fn master_state(&self) -> Result<Priority, CallError> {
        Ok(self.mos.master_state())
    }
}

impl ManagerApi for DataManager {
    /// Registers a new replica: bootstraps the all-keys shard on a blank
    /// node, then links every shard the replica owns into the group.
    fn register(&self, addr: &Addr) -> Result<(), CallError> {
        self.mos.assert_master()?;

        let newcomer = self.env.store_proxy(addr);
        let mut state = newcomer.get_state()?;
        if state.shards.is_empty() {
            newcomer.add_shard(&ShardId::root())?;
            state = newcomer.get_state()?;
        }

        let existing = self.group_states(Some(addr))?;
        for sid in state.shards.keys() {
            self.add_replica(sid, addr, &existing)?;
        }
        Ok(())
    }

    /// Unlinks a replica and drops its data. Refused while the replica is
    /// master of any of its shards.
    fn remove_replica(&self, addr: &Addr) -> Result<(), CallError> {
        self.mos.assert_master()?;

        let states = self.group_states(None)?;
        let masters = Self::masters_from(&states);
        let Some((_, victim)) = states.iter().find(|(a, _)| a == addr) else {
            return Ok(());
        };
        for sid in victim.shards.keys() {
            if masters.get(sid) == Some(addr) {
                return Err(CallError::Other(format!(
                    "{addr} is the master of shard {sid:?}; demote it first"
                )));
            }
        }

        let victim_proxy = self.env.store_proxy(addr);
        for sid in victim.shards.keys() {
            for (peer, state) in &states {
                if peer == addr || !state.shards.contains_key(sid) {
                    continue;
                }
                if let Err(e) = self.env.store_proxy(peer).remove_peer(sid, addr) {
                    tracing::warn!(peer = %peer, error = %e, "cannot unlink peer");
                }
                if let Err(e) = victim_proxy.remove_peer(sid, peer) {
                    tracing::warn!(addr = %addr, error = %e, "cannot unlink removed replica");
                }
            }
            victim_proxy.remove_data(sid)?;
        }
        tracing::info!(addr = %addr, "replica removed");
        Ok(())
    }

    /// The authoritative routing map, recomputed from freshly-queried
    /// replica state on every call.
    fn get_masters(&self) -> Result<MasterMap, CallError> {
        self.mos.assert_master()?;
        Ok(Self::masters_from(&self.group_states(None)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galena_types::ShardState;

    fn state(shards: Vec<(&str, Vec<i64>)>) -> NodeState {
        NodeState {
            shards: shards
                .into_iter()
                .map(|(sid, priority)| {
                    (
                        ShardId::from(sid),
                        ShardState {
                            replicas: Vec::new(),
                            priority: Priority::new(priority),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn masters_from_picks_the_maximal_vector_per_shard() {
        let states = vec![
            (
                Addr::new("file@SmallFS-node1.SmallFSRep"),
                state(vec![("0", vec![0, 1, 10]), ("1", vec![1, 1, 3])]),
            ),
            (
                Addr::new("file@SmallFS-node2.SmallFSRep"),
                state(vec![("0", vec![0, 1, 90]), ("1", vec![0, 1, 999])]),
            ),
        ];
        let masters = DataManager::masters_from(&states);
        assert_eq!(
            masters.get(&ShardId::from("0")).unwrap().as_str(),
            "file@SmallFS-node2.SmallFSRep"
        );
        assert_eq!(
            masters.get(&ShardId::from("1")).unwrap().as_str(),
            "file@SmallFS-node1.SmallFSRep"
        );
    }

    #[test]
    fn masters_from_nothing_is_empty() {
        assert!(DataManager::masters_from(&[]).is_empty());
    }
}
