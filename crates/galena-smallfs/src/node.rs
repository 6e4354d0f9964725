//! The small-file replica servant.

use std::sync::Arc;

use bytes::Bytes;
use galena_cluster::{Antenna, DataNode, notify_online};
use galena_fabric::Future;
use galena_rpc::{Env, StoreApi, UpdateSink, fault_from_call};
use galena_types::{Addr, CallError, NodeState, ShardId};

use crate::shard::FileShardFactory;

/// The replica servant for the small-file store.
///
/// Client operations (`read`, `write`, `remove`, `list`) are served only
/// by the shard's master — any other replica answers `NoShard`, which the
/// client's retry turns into a route refresh. The `*_rep` variants answer
/// from this replica's own state regardless of mastership, and
/// `begin_update` is the replication inlet peers stream into.
pub struct FileNode {
    node: Arc<DataNode<FileShardFactory>>,
}

impl FileNode {
    pub fn new(env: &Env) -> Result<Arc<Self>, CallError> {
        Self::with_factory(env, FileShardFactory::default())
    }

    pub fn with_factory(env: &Env, factory: FileShardFactory) -> Result<Arc<Self>, CallError> {
        Ok(Arc::new(Self {
            node: DataNode::new(env, factory)?,
        }))
    }

    /// Builds the servant and publishes it (plus its antenna) on this
    /// node's adapter; the online broadcast goes out on activation.
    pub fn serve(env: &Env) -> Result<Arc<Self>, CallError> {
        let servant = Self::new(env)?;
        env.grid().provide_store(servant.addr(), servant.clone());
        env.grid()
            .provide_antenna(&servant.addr().antenna(), Antenna::new(env));
        let server_id = env.server_id().to_string();
        env.on_activation(move |env| notify_online(env, &server_id));
        Ok(servant)
    }

    pub fn addr(&self) -> &Addr {
        self.node.addr()
    }

    pub fn node(&self) -> &Arc<DataNode<FileShardFactory>> {
        &self.node
    }
}

impl UpdateSink for FileNode {
    fn begin_update(&self, msg: Bytes) -> Future<()> {
        match self.node.update(&msg) {
            Ok(()) => Future::resolved(()),
            Err(e) => Future::failed(fault_from_call(e)),
        }
    }
}

impl StoreApi for FileNode {
    fn read(&self, path: &str) -> Result<String, CallError> {
        self.node.master_slot_for_key(path)?.shard.read(path)
    }

    fn write(&self, path: &str, data: &str) -> Result<(), CallError> {
        self.node.master_slot_for_key(path)?.shard.write(path, data)
    }

    fn remove(&self, path: &str) -> Result<(), CallError> {
        self.node.master_slot_for_key(path)?.shard.remove(path)
    }

    fn list(&self, shard: &ShardId) -> Result<Vec<String>, CallError> {
        self.node.master_slot(shard)?.shard.list()
    }

    fn read_rep(&self, path: &str) -> Result<String, CallError> {
        let sid = self
            .node
            .shard_for(path)
            .ok_or_else(|| CallError::no_shard_for(path))?;
        self.node.slot(&sid)?.shard.read(path)
    }

    fn list_rep(&self, shard: &ShardId) -> Result<Vec<String>, CallError> {
        self.node.slot(shard)?.shard.list()
    }

    fn get_state(&self) -> Result<NodeState, CallError> {
        self.node.get_state()
    }

    fn add_shard(&self, shard: &ShardId) -> Result<(), CallError> {
        self.node.add_shard(shard)
    }

    fn remove_data(&self, shard: &ShardId) -> Result<(), CallError> {
        self.node.remove_data(shard)
    }

    fn add_peer(&self, shard: &ShardId, addr: &Addr, sync: bool) -> Result<(), CallError> {
        self.node.add_peer(shard, addr, sync)
    }

    fn remove_peer(&self, shard: &ShardId, addr: &Addr) -> Result<(), CallError> {
        self.node.remove_peer(shard, addr)
    }

    fn peers(&self, shard: &ShardId) -> Result<Vec<Addr>, CallError> {
        self.node.peers(shard)
    }
}
