//! Published replication state.
//!
//! Replicas answer `get_state` with a [`NodeState`]; the manager reduces a
//! set of them to a [`MasterMap`]. Both travel as JSON, so the field names
//! here are wire-visible.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Addr, Priority, ShardId};

/// Replication state of one shard on one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    /// The peers this replica relays updates to.
    pub replicas: Vec<Addr>,
    /// The replica's election priority for this shard.
    pub priority: Priority,
}

/// Replication state of one replica, published on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeState {
    pub shards: BTreeMap<ShardId, ShardState>,
}

impl NodeState {
    /// The shard ids this replica owns.
    pub fn shard_ids(&self) -> impl Iterator<Item = &ShardId> {
        self.shards.keys()
    }
}

/// The manager's answer to "who is master where": shard id to the address
/// of the replica whose priority vector is maximal.
pub type MasterMap = BTreeMap<ShardId, Addr>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_state_round_trips_as_json() {
        let mut shards = BTreeMap::new();
        shards.insert(
            ShardId::root(),
            ShardState {
                replicas: vec![Addr::new("file@SmallFS-node2.SmallFSRep")],
                priority: Priority::new(vec![1, 1, 77]),
            },
        );
        let state = NodeState { shards };

        let json = serde_json::to_string(&state).unwrap();
        let back: NodeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);

        // Wire shape is stable: shard ids are the JSON object keys.
        assert!(json.contains(r#""shards":{"":{"#), "{json}");
    }
}
