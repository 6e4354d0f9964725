//! The relay state machine: ships one shard's updates to one peer.
//!
//! A relay can populate a new (or stale) peer from a snapshot of current
//! state and keep an up-to-date peer in sync, switching from one mode to
//! the other on its own. It moves through three states:
//!
//! - `LISTING` — a background task writes every key of the source to the
//!   on-disk `DATALIST` file while log entries stream to the peer
//! - `COPYING` — each listed key is dumped and replayed to the peer,
//!   interleaved with log entries so ordering holds
//! - `REPLICATING` — log entries ship as they appear
//!
//! The relay is a persistent object: it lives in a `CapDict` and re-saves
//! `{addr, state, pos, copy_pos}` before any network call that depends on
//! them, so after a crash the record alone is enough to resume — `LISTING`
//! rewrites the listing from scratch, `COPYING` skips `copy_pos` lines,
//! `REPLICATING` picks up at `pos`.
//!
//! At most one remote call is outstanding per relay (the `in_update`
//! flag). An error from the peer stops the relay without advancing
//! anything; the next `start()` — on append, on activation, or on a
//! peer-online notification — retries from the persisted position.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use galena_rpc::{Env, UpdateSink, call_from_fault};
use galena_storage::{JsonMap, Registry, SaveFn, StorageError, Stored};
use galena_types::{Addr, CallError};

/// Name of the listing file, present only during `LISTING`/`COPYING`.
const DATALIST: &str = "DATALIST";

/// What a relay needs from the shard it replicates.
pub trait RelaySource: Send + Sync {
    /// Every key currently stored.
    fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Snapshot of one key: the log sequence it is current as of, plus the
    /// updates that reproduce it on an empty peer (none if the key has
    /// vanished since listing).
    fn dump(&self, key: &str) -> Result<(i64, Vec<Bytes>), StorageError>;

    /// The log entry at `seq`.
    fn get(&self, seq: i64) -> Result<Bytes, StorageError>;

    /// One past the last log sequence.
    fn end(&self) -> Result<i64, StorageError>;

    /// Directory for relay bookkeeping files (the `.rep` directory).
    fn log_dir(&self) -> PathBuf;
}

/// Relay lifecycle state. Transitions only ever run forward:
/// `Listing → Copying → Replicating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Listing,
    Copying,
    Replicating,
}

impl RelayPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayPhase::Listing => "LISTING",
            RelayPhase::Copying => "COPYING",
            RelayPhase::Replicating => "REPLICATING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LISTING" => Some(RelayPhase::Listing),
            "COPYING" => Some(RelayPhase::Copying),
            "REPLICATING" => Some(RelayPhase::Replicating),
            _ => None,
        }
    }
}

/// Context injected into relay factories: the ambient environment, the
/// shard being replicated, and (for tests) an explicit update sink that
/// overrides proxy resolution.
pub struct RelayCtx {
    pub env: Env,
    pub source: Weak<dyn RelaySource>,
    pub sink: Option<Arc<dyn UpdateSink>>,
}

impl RelayCtx {
    fn target_for(&self, addr: &Addr) -> Arc<dyn UpdateSink> {
        self.sink
            .clone()
            .unwrap_or_else(|| self.env.update_sink(addr))
    }
}

struct RelayInner {
    phase: RelayPhase,
    /// Next log sequence to ship; `None` until `LISTING` fixes it.
    pos: Option<i64>,
    /// Line index into `DATALIST` during `COPYING`.
    copy_pos: Option<u64>,
    started: bool,
    in_update: bool,
    /// Open listing reader, positioned at `copy_pos`.
    listing: Option<Lines<BufReader<File>>>,
    /// Snapshot currently being replayed, with the sequence it was taken at.
    dump_seq: i64,
    dump: Option<std::vec::IntoIter<Bytes>>,
}

/// The relay state machine; see the module docs.
pub struct DataRelay {
    addr: Addr,
    env: Env,
    source: Weak<dyn RelaySource>,
    target: Arc<dyn UpdateSink>,
    listing_path: PathBuf,
    inner: Mutex<RelayInner>,
    /// A `copy_one` step waiting to run; drained by `run()`.
    copy_queued: AtomicBool,
    save: Mutex<Option<SaveFn>>,
    /// Handle to this relay's own Arc, for completion callbacks and the
    /// background listing task.
    me: Weak<DataRelay>,
}

impl DataRelay {
    /// A relay toward `addr`, resolved through the environment.
    pub fn new(
        env: &Env,
        source: &Arc<dyn RelaySource>,
        addr: Addr,
        phase: RelayPhase,
        pos: Option<i64>,
    ) -> Arc<Self> {
        let target = env.update_sink(&addr);
        Self::with_target(env, source, addr, phase, pos, target)
    }

    /// A relay with an explicit target, bypassing proxy resolution.
    pub fn with_target(
        env: &Env,
        source: &Arc<dyn RelaySource>,
        addr: Addr,
        phase: RelayPhase,
        pos: Option<i64>,
        target: Arc<dyn UpdateSink>,
    ) -> Arc<Self> {
        let listing_path = source.log_dir().join(DATALIST);
        Arc::new_cyclic(|me| Self {
            addr,
            env: env.clone(),
            source: Arc::downgrade(source),
            target,
            listing_path,
            inner: Mutex::new(RelayInner {
                phase,
                pos,
                copy_pos: None,
                started: false,
                in_update: false,
                listing: None,
                dump_seq: 0,
                dump: None,
            }),
            copy_queued: AtomicBool::new(false),
            save: Mutex::new(None),
            me: me.clone(),
        })
    }

    fn from_record(ctx: &RelayCtx, body: &JsonMap) -> Result<Arc<Self>, StorageError> {
        let addr = Addr::new(
            body.get("addr")
                .and_then(|v| v.as_str())
                .ok_or_else(|| StorageError::NoSuchKey("addr".into()))?,
        );
        let phase = body
            .get("state")
            .and_then(|v| v.as_str())
            .and_then(RelayPhase::parse)
            .ok_or_else(|| StorageError::NoSuchKey("state".into()))?;
        let pos = body.get("pos").and_then(serde_json::Value::as_i64);
        let copy_pos = body.get("copy_pos").and_then(serde_json::Value::as_u64);

        let target = ctx.target_for(&addr);
        let listing_path = ctx
            .source
            .upgrade()
            .map(|s| s.log_dir().join(DATALIST))
            .ok_or_else(|| StorageError::NoSuchKey("source".into()))?;
        Ok(Arc::new_cyclic(|me| Self {
            addr,
            env: ctx.env.clone(),
            source: ctx.source.clone(),
            target,
            listing_path,
            inner: Mutex::new(RelayInner {
                phase,
                pos,
                copy_pos,
                started: false,
                in_update: false,
                listing: None,
                dump_seq: 0,
                dump: None,
            }),
            copy_queued: AtomicBool::new(false),
            save: Mutex::new(None),
            me: me.clone(),
        }))
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    pub fn phase(&self) -> RelayPhase {
        self.lock().phase
    }

    /// Persisted position: the next log sequence to ship.
    pub fn pos(&self) -> Option<i64> {
        self.lock().pos
    }

    pub fn copy_pos(&self) -> Option<u64> {
        self.lock().copy_pos
    }

    /// Starts (or kicks) the relay. Idempotent and cheap: called on every
    /// source append, on process activation, and when the peer comes
    /// online. A relay stopped by an error resumes from its persisted
    /// position.
    pub fn start(&self) {
        let mut start_updates = false;
        {
            let mut inner = self.lock();
            if inner.started {
                if inner.phase == RelayPhase::Copying {
                    // The copy loop drives itself while an update is in
                    // flight; restart it if an error left it stopped.
                    if !inner.in_update {
                        self.schedule_copy();
                    }
                } else {
                    start_updates = !inner.in_update;
                }
            } else {
                match inner.phase {
                    RelayPhase::Listing => {
                        if inner.pos.is_none() {
                            let Some(source) = self.source.upgrade() else {
                                return;
                            };
                            match source.end() {
                                Ok(end) => {
                                    inner.pos = Some(end);
                                    self.persist(&inner);
                                }
                                Err(e) => {
                                    tracing::error!(addr = %self.addr, error = %e, "relay cannot read source end");
                                    return;
                                }
                            }
                        }
                        if let Some(me) = self.me.upgrade() {
                            self.env.submit(move || me.list_source());
                        }
                        start_updates = true;
                    }
                    RelayPhase::Copying => self.schedule_copy(),
                    RelayPhase::Replicating => start_updates = true,
                }
                inner.started = true;
            }
            if start_updates {
                inner.in_update = true;
            }
        }
        if start_updates {
            self.push_next();
        }
        self.run();
    }

    /// The background listing task: writes every source key to `DATALIST`,
    /// one per line, then transitions to `COPYING`. Rewrites the file from
    /// scratch, so an interrupted listing is simply redone.
    fn list_source(&self) {
        let result = (|| -> Result<(), StorageError> {
            let Some(source) = self.source.upgrade() else {
                return Ok(());
            };
            let mut out = File::create(&self.listing_path)?;
            for key in source.list()? {
                out.write_all(key.as_bytes())?;
                out.write_all(b"\n")?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                {
                    let mut inner = self.lock();
                    inner.phase = RelayPhase::Copying;
                    inner.copy_pos = Some(0);
                    self.persist(&inner);
                    tracing::debug!(addr = %self.addr, "relay listing complete, copying");
                }
                self.schedule_copy();
                self.run();
            }
            Err(e) => {
                tracing::error!(addr = %self.addr, error = %e, "relay listing failed");
            }
        }
    }

    /// Takes the next key from the listing and dumps it; at the end of the
    /// listing, transitions to `REPLICATING` and removes `DATALIST`.
    fn copy_one(&self) {
        {
            let mut inner = self.lock();
            if inner.in_update {
                // An update is still in flight; its completion re-enters
                // the copy loop.
                return;
            }
            if inner.listing.is_none() {
                let file = match File::open(&self.listing_path) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::error!(addr = %self.addr, error = %e, "relay cannot open listing");
                        return;
                    }
                };
                let mut lines = BufReader::new(file).lines();
                for _ in 0..inner.copy_pos.unwrap_or(0) {
                    lines.next();
                }
                inner.listing = Some(lines);
            }
            match inner.listing.as_mut().and_then(Iterator::next) {
                None => {
                    inner.phase = RelayPhase::Replicating;
                    inner.listing = None;
                    inner.copy_pos = None;
                    inner.dump = None;
                    self.persist(&inner);
                    let _ = fs::remove_file(&self.listing_path);
                    tracing::debug!(addr = %self.addr, "relay copy complete, replicating");
                }
                Some(Err(e)) => {
                    tracing::error!(addr = %self.addr, error = %e, "relay cannot read listing");
                    return;
                }
                Some(Ok(key)) => {
                    let Some(source) = self.source.upgrade() else {
                        return;
                    };
                    match source.dump(&key) {
                        Ok((seq, updates)) => {
                            inner.dump_seq = seq;
                            inner.dump = Some(updates.into_iter());
                        }
                        Err(e) => {
                            // Stop without advancing; the next kick reopens
                            // the listing at the persisted copy_pos and
                            // re-dumps this key.
                            tracing::error!(addr = %self.addr, key = %key, error = %e, "relay cannot dump key");
                            inner.listing = None;
                            inner.dump = None;
                            return;
                        }
                    }
                }
            }
            inner.in_update = true;
        }
        self.push_next();
    }

    /// Submits the next update to the peer, or schedules the next
    /// `copy_one`, or goes idle.
    ///
    /// In `COPYING`, pending log entries below the snapshot sequence flush
    /// first (advancing `pos` per ack); then the snapshot's own updates
    /// replay without advancing `pos`; then the next key is copied.
    fn push_next(&self) {
        let mut submission: Option<(Bytes, bool)> = None;
        {
            let mut inner = self.lock();
            debug_assert!(inner.in_update, "push_next outside an update window");
            let Some(source) = self.source.upgrade() else {
                inner.in_update = false;
                return;
            };
            if inner.phase == RelayPhase::Copying {
                let pos = inner.pos.unwrap_or(0);
                if inner.dump.is_none() {
                    inner.in_update = false;
                    self.schedule_copy();
                } else if pos < inner.dump_seq {
                    match source.get(pos) {
                        Ok(msg) => submission = Some((msg, true)),
                        Err(e) => {
                            tracing::error!(addr = %self.addr, seq = pos, error = %e, "relay cannot read log entry");
                            inner.in_update = false;
                            inner.listing = None;
                            inner.dump = None;
                        }
                    }
                } else {
                    match inner.dump.as_mut().and_then(Iterator::next) {
                        Some(msg) => submission = Some((msg, false)),
                        None => {
                            inner.copy_pos = Some(inner.copy_pos.unwrap_or(0) + 1);
                            inner.dump = None;
                            self.persist(&inner);
                            inner.in_update = false;
                            self.schedule_copy();
                        }
                    }
                }
            } else {
                let pos = inner.pos.unwrap_or(0);
                let end = match source.end() {
                    Ok(end) => end,
                    Err(e) => {
                        tracing::error!(addr = %self.addr, error = %e, "relay cannot read source end");
                        inner.in_update = false;
                        return;
                    }
                };
                if pos < end {
                    match source.get(pos) {
                        Ok(msg) => submission = Some((msg, true)),
                        Err(e) => {
                            tracing::error!(addr = %self.addr, seq = pos, error = %e, "relay cannot read log entry");
                            inner.in_update = false;
                        }
                    }
                } else {
                    inner.in_update = false;
                }
            }
        }
        if let Some((msg, advance)) = submission {
            let Some(ok) = self.me.upgrade() else {
                return;
            };
            let err = Arc::clone(&ok);
            self.target.begin_update(msg).callbacks(
                move |()| ok.on_update_ok(advance),
                move |fault| err.on_update_err(&call_from_fault(&fault)),
            );
        }
    }

    /// Ack from the peer: advance and persist the position (for log
    /// entries), then continue.
    fn on_update_ok(&self, advance: bool) {
        if advance {
            let mut inner = self.lock();
            inner.pos = Some(inner.pos.unwrap_or(0) + 1);
            self.persist(&inner);
        }
        self.push_next();
        self.run();
    }

    /// Error from the peer: no position advance, stop until the next kick.
    fn on_update_err(&self, err: &CallError) {
        if !matches!(err, CallError::NoEndpoint { .. }) {
            tracing::warn!(addr = %self.addr, error = %err, "relay update rejected");
        }
        let mut inner = self.lock();
        inner.in_update = false;
        if inner.phase == RelayPhase::Copying {
            // Drop the in-memory copy cursor; the next kick re-derives it
            // from the persisted copy_pos, re-dumping the interrupted key.
            inner.listing = None;
            inner.dump = None;
        }
    }

    fn schedule_copy(&self) {
        self.copy_queued.store(true, Ordering::SeqCst);
    }

    /// Drains scheduled `copy_one` steps. Runs on whichever thread
    /// completed the work that scheduled them.
    fn run(&self) {
        while self.copy_queued.swap(false, Ordering::SeqCst) {
            self.copy_one();
        }
    }

    /// Re-persists `{addr, state, pos, copy_pos}` through the save
    /// callback. Positions are always persisted before the next network
    /// call that depends on them.
    fn persist(&self, inner: &RelayInner) {
        let record = Self::record(&self.addr, inner.phase, inner.pos, inner.copy_pos);
        let save = self.save.lock().expect("save slot poisoned").clone();
        match save {
            Some(save) => save(record),
            None => {
                tracing::debug!(addr = %self.addr, "relay has no save binding yet");
            }
        }
    }

    fn record(addr: &Addr, phase: RelayPhase, pos: Option<i64>, copy_pos: Option<u64>) -> JsonMap {
        let mut body = JsonMap::new();
        body.insert("addr".into(), addr.as_str().into());
        body.insert("state".into(), phase.as_str().into());
        body.insert("pos".into(), pos.map_or(serde_json::Value::Null, Into::into));
        body.insert(
            "copy_pos".into(),
            copy_pos.map_or(serde_json::Value::Null, Into::into),
        );
        body
    }

    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        self.inner.lock().expect("relay lock poisoned")
    }
}

impl Stored for DataRelay {
    fn tag(&self) -> &'static str {
        "DataRelay"
    }

    fn encode(&self) -> JsonMap {
        let inner = self.lock();
        Self::record(&self.addr, inner.phase, inner.pos, inner.copy_pos)
    }

    fn bind_save(&self, save: SaveFn) {
        *self.save.lock().expect("save slot poisoned") = Some(save);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

/// Registers the relay factory under its `CLS` tag.
pub fn register_relay_factory(registry: &mut Registry<RelayCtx>) {
    registry.register("DataRelay", |ctx, body| {
        Ok(DataRelay::from_record(ctx, &body)? as Arc<dyn Stored>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use galena_fabric::Future;
    use galena_rpc::fault_from_call;
    use galena_storage::{CapDict, MemStore, downcast};
    use galena_test_harness::LoopGrid;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// In-memory stand-in for a shard: key/value data plus a log of
    /// `["w"|"r", path, data]` messages. Plays both source and target.
    struct FakeNode {
        data: Mutex<BTreeMap<String, String>>,
        log: Mutex<Vec<Bytes>>,
        relay: Mutex<Option<Arc<DataRelay>>>,
        /// Acks granted before updates start parking; `step` releases one
        /// parked update and refills this.
        ack_budget: Mutex<u32>,
        parked: Mutex<Vec<Future<()>>>,
        fail_next: AtomicBool,
        fail_dump: AtomicBool,
        during_list: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
        dir: PathBuf,
    }

    impl FakeNode {
        fn new(dir: &TempDir, name: &str) -> Arc<Self> {
            let dir = dir.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            Arc::new(Self {
                data: Mutex::new(BTreeMap::new()),
                log: Mutex::new(Vec::new()),
                relay: Mutex::new(None),
                ack_budget: Mutex::new(u32::MAX),
                parked: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
                fail_dump: AtomicBool::new(false),
                during_list: Mutex::new(Vec::new()),
                dir,
            })
        }

        fn msg(kind: &str, path: &str, data: Option<&str>) -> Bytes {
            Bytes::from(serde_json::to_vec(&(kind, path, data)).unwrap())
        }

        fn write(&self, path: &str, data: &str) {
            self.data.lock().unwrap().insert(path.into(), data.into());
            self.log.lock().unwrap().push(Self::msg("w", path, Some(data)));
            let relay = self.relay.lock().unwrap().clone();
            if let Some(relay) = relay {
                relay.start();
            }
        }

        fn remove(&self, path: &str) {
            if self.data.lock().unwrap().remove(path).is_none() {
                return;
            }
            self.log.lock().unwrap().push(Self::msg("r", path, None));
            let relay = self.relay.lock().unwrap().clone();
            if let Some(relay) = relay {
                relay.start();
            }
        }

        fn apply(&self, msg: &Bytes) {
            let (kind, path, data): (String, String, Option<String>) =
                serde_json::from_slice(msg).unwrap();
            if kind == "w" {
                self.write(&path, &data.unwrap_or_default());
            } else {
                self.remove(&path);
            }
        }

        fn snapshot(&self) -> BTreeMap<String, String> {
            self.data.lock().unwrap().clone()
        }

        fn pause_after(&self, acks: u32) {
            *self.ack_budget.lock().unwrap() = acks;
        }

        /// Releases one parked update and allows `n - 1` further acks.
        fn step(&self, n: u32) {
            let parked = self.parked.lock().unwrap().pop().expect("an update is parked");
            *self.ack_budget.lock().unwrap() = n - 1;
            parked.resolve(());
        }

        fn drop_parked(&self) {
            self.parked.lock().unwrap().clear();
        }

        fn on_list(&self, f: impl FnOnce() + Send + 'static) {
            self.during_list.lock().unwrap().push(Box::new(f));
        }
    }

    impl RelaySource for FakeNode {
        fn list(&self) -> Result<Vec<String>, StorageError> {
            let keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
            let hooks: Vec<_> = std::mem::take(&mut *self.during_list.lock().unwrap());
            for hook in hooks {
                hook();
            }
            Ok(keys)
        }

        fn dump(&self, key: &str) -> Result<(i64, Vec<Bytes>), StorageError> {
            if self.fail_dump.swap(false, Ordering::SeqCst) {
                return Err(StorageError::NoSuchKey(key.to_string()));
            }
            let seq = self.log.lock().unwrap().len() as i64;
            let updates = match self.data.lock().unwrap().get(key) {
                Some(data) => vec![Self::msg("w", key, Some(data))],
                None => Vec::new(),
            };
            Ok((seq, updates))
        }

        fn get(&self, seq: i64) -> Result<Bytes, StorageError> {
            self.log
                .lock()
                .unwrap()
                .get(seq as usize)
                .cloned()
                .ok_or(StorageError::NoSuchSeq(seq))
        }

        fn end(&self) -> Result<i64, StorageError> {
            Ok(self.log.lock().unwrap().len() as i64)
        }

        fn log_dir(&self) -> PathBuf {
            self.dir.clone()
        }
    }

    impl UpdateSink for FakeNode {
        fn begin_update(&self, msg: Bytes) -> Future<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Future::failed(fault_from_call(CallError::Other("update failed".into())));
            }
            self.apply(&msg);
            let mut budget = self.ack_budget.lock().unwrap();
            if *budget > 0 {
                *budget -= 1;
                Future::resolved(())
            } else {
                let parked = Future::new();
                self.parked.lock().unwrap().push(parked.clone());
                parked
            }
        }
    }

    struct Fixture {
        _tmp: TempDir,
        env: Env,
        source: Arc<FakeNode>,
        target: Arc<FakeNode>,
        sinks: CapDict<RelayCtx>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let grid = Arc::new(LoopGrid::new());
            let env = Env::new(grid, tmp.path().join("data"), "Test-node1", 1);

            let source = FakeNode::new(&tmp, "source");
            let target = FakeNode::new(&tmp, "target");

            source.write("a", "Apple");
            source.write("b", "Bear");
            source.write("c", "Cat");

            let mut registry = Registry::new();
            register_relay_factory(&mut registry);
            let ctx = RelayCtx {
                env: env.clone(),
                source: Arc::downgrade(&(source.clone() as Arc<dyn RelaySource>)),
                sink: Some(target.clone() as Arc<dyn UpdateSink>),
            };
            let sinks = CapDict::new(Arc::new(MemStore::new()), Arc::new(registry), ctx);

            Self {
                _tmp: tmp,
                env,
                source,
                target,
                sinks,
            }
        }

        fn make_relay(&self) -> Arc<DataRelay> {
            let relay = DataRelay::with_target(
                &self.env,
                &(self.source.clone() as Arc<dyn RelaySource>),
                Addr::new("fake@Test-node2.TestRep"),
                RelayPhase::Listing,
                None,
                self.target.clone() as Arc<dyn UpdateSink>,
            );
            self.sinks.insert("relay", relay.clone()).unwrap();
            *self.source.relay.lock().unwrap() = Some(relay.clone());
            relay
        }

        /// Simulates loss of in-memory state: the persisted record alone
        /// drives the resumed relay.
        fn rehydrate(&self) -> Arc<DataRelay> {
            self.sinks.evict("relay");
            let relay =
                downcast::<DataRelay>(self.sinks.get("relay").unwrap().unwrap()).unwrap();
            *self.source.relay.lock().unwrap() = Some(relay.clone());
            relay
        }

        fn settle(&self) {
            self.env.pool().flush();
        }
    }

    #[test]
    fn syncs_then_replicates() {
        let fx = Fixture::new();
        let relay = fx.make_relay();
        relay.start();
        fx.settle();

        assert_eq!(fx.source.snapshot(), fx.target.snapshot());
        assert_eq!(relay.phase(), RelayPhase::Replicating);

        fx.source.write("f", "Fred");
        fx.settle();
        assert_eq!(fx.target.snapshot().get("f").map(String::as_str), Some("Fred"));
    }

    #[test]
    fn failed_update_stops_then_resumes_after_rehydrate() {
        let fx = Fixture::new();
        let relay = fx.make_relay();
        relay.start();
        fx.settle();
        assert_eq!(fx.source.snapshot(), fx.target.snapshot());

        fx.target.fail_next.store(true, Ordering::SeqCst);
        fx.source.write("f", "Fish");
        fx.settle();
        assert_ne!(fx.source.snapshot(), fx.target.snapshot());
        // No ack, no advance.
        let stalled_pos = relay.pos().unwrap();

        let relay = fx.rehydrate();
        assert_eq!(relay.pos().unwrap(), stalled_pos);
        fx.source.write("c", "Chips");
        fx.settle();
        assert_eq!(fx.source.snapshot(), fx.target.snapshot());
    }

    #[test]
    fn changes_during_listing_still_converge() {
        let fx = Fixture::new();
        let relay = fx.make_relay();
        {
            let source = fx.source.clone();
            fx.source.on_list(move || source.write("a", "Antelope"));
        }
        {
            let source = fx.source.clone();
            fx.source.on_list(move || source.remove("b"));
        }
        relay.start();
        fx.settle();
        assert_eq!(fx.source.snapshot(), fx.target.snapshot());
        assert_eq!(relay.phase(), RelayPhase::Replicating);
    }

    #[test]
    fn changes_during_copy_still_converge() {
        let fx = Fixture::new();
        let relay = fx.make_relay();
        fx.target.pause_after(1);
        relay.start();
        fx.settle();

        assert_eq!(relay.phase(), RelayPhase::Copying);
        fx.source.write("b", "Bean");
        fx.source.write("d", "Dog");
        fx.source.remove("c");
        fx.target.step(u32::MAX);
        fx.settle();

        assert_eq!(fx.source.snapshot(), fx.target.snapshot());
    }

    #[test]
    fn failed_dump_stalls_then_retries_the_same_key() {
        let fx = Fixture::new();
        let relay = fx.make_relay();
        fx.source.fail_dump.store(true, Ordering::SeqCst);
        relay.start();
        fx.settle();

        // The first key's dump failed: no advance, no silent skip.
        assert_eq!(relay.phase(), RelayPhase::Copying);
        assert_eq!(relay.copy_pos(), Some(0));
        assert_ne!(fx.source.snapshot(), fx.target.snapshot());

        // The next kick re-dumps the same key and the copy completes.
        relay.start();
        fx.settle();
        assert_eq!(relay.phase(), RelayPhase::Replicating);
        assert_eq!(fx.source.snapshot(), fx.target.snapshot());
    }

    #[test]
    fn crash_during_copy_resumes_from_copy_pos() {
        let fx = Fixture::new();
        let relay = fx.make_relay();
        fx.target.pause_after(1);
        relay.start();
        fx.settle();
        assert_eq!(relay.phase(), RelayPhase::Copying);

        // The process dies: parked acks vanish with the in-memory state.
        fx.target.drop_parked();
        fx.target.pause_after(u32::MAX);
        let relay = fx.rehydrate();
        assert_eq!(relay.phase(), RelayPhase::Copying);

        relay.start();
        fx.settle();
        assert_eq!(fx.source.snapshot(), fx.target.snapshot());
        assert_eq!(relay.phase(), RelayPhase::Replicating);
        assert_eq!(relay.copy_pos(), None);
        assert!(!fx.source.log_dir().join(DATALIST).exists());
    }

    #[test]
    fn phase_never_moves_backward() {
        let fx = Fixture::new();
        let relay = fx.make_relay();
        let order = |p: RelayPhase| match p {
            RelayPhase::Listing => 0,
            RelayPhase::Copying => 1,
            RelayPhase::Replicating => 2,
        };
        let mut last = order(relay.phase());
        relay.start();
        for _ in 0..50 {
            let now = order(relay.phase());
            assert!(now >= last, "phase moved backward");
            last = now;
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        fx.settle();
        assert_eq!(relay.phase(), RelayPhase::Replicating);
    }

    #[test]
    fn persisted_record_round_trips() {
        let record = DataRelay::record(
            &Addr::new("file@SmallFS-node2.SmallFSRep"),
            RelayPhase::Copying,
            Some(7),
            Some(2),
        );
        assert_eq!(record["addr"], "file@SmallFS-node2.SmallFSRep");
        assert_eq!(record["state"], "COPYING");
        assert_eq!(record["pos"], 7);
        assert_eq!(record["copy_pos"], 2);
    }
}
