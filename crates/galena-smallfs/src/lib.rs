//! # galena-smallfs: a replicated store for small files
//!
//! The reference implementation of the shard contract: files live under
//! `<data>/<node>/file/S<bits>/`, every mutation is logged as a JSON
//! `{path, data}` message (`data: null` meaning delete), and `update`
//! applies such a message — the exact inverse, which is all the
//! replication engine asks of a data type.
//!
//! [`FileNode`] is the replica servant: reads and writes are routed
//! through per-shard mastership, the `*_rep` variants answer from local
//! state, and `begin_update` receives replication traffic from peers.

pub mod node;
pub mod shard;

pub use node::FileNode;
pub use shard::{FileShard, FileShardFactory, FileUpdate};
