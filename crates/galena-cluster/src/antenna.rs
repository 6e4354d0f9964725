//! Online notification.
//!
//! When a server activates, it broadcasts a one-way `server_online` to
//! every other active server's antenna. The receiving servant publishes a
//! local `online` event; shards whose relays target the newly-online peer
//! kick them. This turns "peer came back" into a bounded-delay catch-up
//! instead of a wait for the next mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use galena_rpc::{AntennaApi, Env};
use galena_types::Addr;

/// The receiving servant: forwards the notification onto the local
/// `online` channel.
pub struct Antenna {
    env: Env,
}

impl Antenna {
    pub fn new(env: &Env) -> Arc<Self> {
        Arc::new(Self { env: env.clone() })
    }
}

impl AntennaApi for Antenna {
    fn server_online(&self, server_id: &str) {
        tracing::debug!(server_id, "peer online");
        self.env.notify("online", server_id);
    }
}

/// Broadcasts `server_online(server_id)` to every other active server,
/// one adapter per server (preferring the replicated `...Rep` adapter).
/// One-way: delivery failures are dropped by the transport.
pub fn notify_online(env: &Env, server_id: &str) {
    let grid = env.grid();
    let mut chosen: BTreeMap<String, String> = BTreeMap::new();
    for adapter_id in grid.adapter_ids() {
        let Some((target, _)) = adapter_id.split_once('.') else {
            continue;
        };
        if target == server_id {
            continue;
        }
        if !chosen.contains_key(target) || adapter_id.ends_with("Rep") {
            chosen.insert(target.to_string(), adapter_id);
        }
    }
    for (target, adapter_id) in chosen {
        if grid.server_active(&target) {
            let antenna = env.antenna_proxy(&Addr::new(format!("antenna@{adapter_id}")));
            antenna.server_online(server_id);
        }
    }
}
