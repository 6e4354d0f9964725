//! One shard's durable home.
//!
//! A `ShardCore` owns the shard directory
//! (`<data>/<node>/<type>/S<bits>`) and the replication machinery inside
//! its `.rep/` subdirectory. The data type (e.g. the small-file store)
//! embeds a core, implements [`RelaySource`] over its own files, and gets
//! append/peer management for free.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Weak;

use bytes::Bytes;
use galena_rpc::Env;
use galena_storage::Result;
use galena_types::Addr;

use crate::relay::RelaySource;
use crate::rep_log::RepLog;

/// Name of the replication subdirectory inside a shard.
const REP_DIR: &str = ".rep";

/// One shard's durable state and replication log; see the module docs.
pub struct ShardCore {
    env: Env,
    path: PathBuf,
    rep: RepLog,
    source: Weak<dyn RelaySource>,
}

impl ShardCore {
    /// Opens (creating if necessary) the shard rooted at
    /// `<data dir>/<lpath>`. `source` is the owning data type's relay
    /// view of itself, typically built with `Arc::new_cyclic`.
    pub fn open(
        env: &Env,
        lpath: &str,
        source: Weak<dyn RelaySource>,
        segment_limit: u64,
    ) -> Result<Self> {
        let path = env.data_dir().join(lpath);
        fs::create_dir_all(&path)?;
        let rep = RepLog::open(env, path.join(REP_DIR), source.clone(), segment_limit)?;
        Ok(Self {
            env: env.clone(),
            path,
            rep,
            source,
        })
    }

    /// The shard's directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The replication bookkeeping directory (`.rep/`).
    pub fn log_dir(&self) -> &Path {
        self.rep.dir()
    }

    /// One past the last replication-log sequence.
    pub fn end(&self) -> Result<i64> {
        self.rep.end()
    }

    /// The replication-log entry at `seq`.
    pub fn get(&self, seq: i64) -> Result<Bytes> {
        self.rep.get(seq)
    }

    /// Appends a mutation to the log and kicks every peer's relay.
    pub fn append(&self, payload: &[u8]) -> Result<i64> {
        self.rep.append(payload)
    }

    /// True iff no data has ever been stored here: the shard directory
    /// holds nothing but the replication subdirectory.
    pub fn is_new(&self) -> bool {
        match fs::read_dir(&self.path) {
            Ok(entries) => entries.count() < 2,
            Err(_) => true,
        }
    }

    /// The peers this shard replicates to.
    pub fn peers(&self) -> Result<Vec<Addr>> {
        self.rep.sinks()
    }

    /// Adds `addr` as a peer. With `sync`, the new relay populates the
    /// peer from current state; without, it ships only future mutations.
    pub fn add_peer(&self, addr: &Addr, sync: bool) -> Result<()> {
        let Some(source) = self.source.upgrade() else {
            return Ok(());
        };
        self.rep.add_sink(&self.env, &source, addr, sync)
    }

    /// Drops the peer's relay. Not an error if absent.
    pub fn remove_peer(&self, addr: &Addr) -> Result<()> {
        self.rep.remove_sink(addr)
    }

    /// Kicks any relay targeting a peer that just came online. Nothing to
    /// do while the log is empty.
    pub fn on_online(&self, addr: &Addr) {
        match (self.rep.has_sink(addr), self.rep.end()) {
            (Ok(true), Ok(end)) if end > 0 => self.rep.kick(addr),
            _ => {}
        }
    }

    /// Kicks every relay; called on process activation.
    pub fn start_relays(&self) {
        match self.rep.sinks() {
            Ok(addrs) => {
                for addr in addrs {
                    self.rep.kick(&addr);
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot enumerate relays"),
        }
    }

    /// Wipes the shard's directory. Used when demoting a removed replica;
    /// the shard object must be discarded afterwards.
    pub fn remove_data(&self) -> Result<()> {
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}
