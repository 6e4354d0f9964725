//! The replication log: a durable log coupled to its per-peer relays.
//!
//! Lives in a shard's `.rep/` directory: the log segments directly inside
//! it, and one relay record per peer in the `sink/` file dictionary.
//! Appending broadcasts — every relay is kicked so new entries ship as
//! soon as they are durable. Relay state survives restart in the
//! capability dictionary.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use galena_rpc::Env;
use galena_storage::{CapDict, DataArray, DataLog, FileDict, Registry, Result, downcast};
use galena_types::Addr;

use crate::relay::{DataRelay, RelayCtx, RelayPhase, RelaySource, register_relay_factory};

/// A shard's replication log; see the module docs.
pub struct RepLog {
    dir: PathBuf,
    log: DataArray,
    relays: CapDict<RelayCtx>,
}

impl RepLog {
    /// Opens (creating if necessary) the replication log in `dir`, with
    /// relays sourcing from `source`.
    pub fn open(
        env: &Env,
        dir: impl Into<PathBuf>,
        source: Weak<dyn RelaySource>,
        segment_limit: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        let log = DataArray::new(DataLog::with_segment_limit(&dir, segment_limit)?);

        let mut registry = Registry::new();
        register_relay_factory(&mut registry);
        let relays = CapDict::new(
            Arc::new(FileDict::new(dir.join("sink"))),
            Arc::new(registry),
            RelayCtx {
                env: env.clone(),
                source,
                sink: None,
            },
        );

        Ok(Self { dir, log, relays })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// One past the last log sequence.
    pub fn end(&self) -> Result<i64> {
        self.log.end()
    }

    /// The log entry at `seq`.
    pub fn get(&self, seq: i64) -> Result<Bytes> {
        self.log.get(seq)
    }

    /// Appends an entry and kicks every relay. The append is durable
    /// before any peer hears about it.
    pub fn append(&self, payload: &[u8]) -> Result<i64> {
        let seq = self.log.append(payload, None)?;
        self.kick_all();
        Ok(seq)
    }

    /// The peers this log relays to.
    pub fn sinks(&self) -> Result<Vec<Addr>> {
        Ok(self.relays.keys()?.into_iter().map(Addr::new).collect())
    }

    pub fn has_sink(&self, addr: &Addr) -> Result<bool> {
        self.relays.contains(addr.as_str())
    }

    /// Adds a relay toward `addr`. With `sync`, the relay starts in
    /// `LISTING` and populates the peer from current state; without, it
    /// starts in `REPLICATING` at the current end, shipping only future
    /// entries. Present sinks are left untouched.
    pub fn add_sink(&self, env: &Env, source: &Arc<dyn RelaySource>, addr: &Addr, sync: bool) -> Result<()> {
        if self.relays.contains(addr.as_str())? {
            return Ok(());
        }
        let (phase, pos) = if sync {
            (RelayPhase::Listing, None)
        } else {
            (RelayPhase::Replicating, Some(self.log.end()?))
        };
        let relay = DataRelay::new(env, source, addr.clone(), phase, pos);
        self.relays.insert(addr.as_str(), relay.clone())?;
        if sync {
            relay.start();
        }
        Ok(())
    }

    pub fn remove_sink(&self, addr: &Addr) -> Result<()> {
        self.relays.remove(addr.as_str())
    }

    /// The live relay toward `addr`, if one exists.
    pub fn relay(&self, addr: &Addr) -> Result<Option<Arc<DataRelay>>> {
        Ok(self
            .relays
            .get(addr.as_str())?
            .and_then(downcast::<DataRelay>))
    }

    /// Kicks the relay toward `addr`, if present.
    pub fn kick(&self, addr: &Addr) {
        match self.relay(addr) {
            Ok(Some(relay)) => relay.start(),
            Ok(None) => {}
            Err(e) => tracing::warn!(addr = %addr, error = %e, "cannot load relay"),
        }
    }

    fn kick_all(&self) {
        match self.sinks() {
            Ok(addrs) => {
                for addr in addrs {
                    self.kick(&addr);
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot enumerate relays"),
        }
    }
}
