//! # Galena
//!
//! A small, replicated, sharded object-storage service built on an
//! abstract RPC substrate. Clients address data items by path through a
//! replica group; each request is routed to the master replica owning the
//! shard that contains the key, applied there, and asynchronously
//! propagated to every other replica of the shard.
//!
//! This crate is the facade: it re-exports the public surface of the
//! workspace. The pieces live in focused crates:
//!
//! - [`types`] — addresses, shard ids, priority vectors, the wire error
//!   taxonomy
//! - [`fabric`] — futures, the worker pool, the event bus
//! - [`storage`] — the segmented append-only log, file-backed maps, the
//!   capability dictionary
//! - [`rpc`] — the abstract RPC boundary and the per-process [`Env`]
//! - [`replication`] — relays, the replication log, the shard core
//! - [`cluster`] — master election, the shard container, the cluster
//!   manager, online notification
//! - [`client`] — the master-aware client with stale-route retry
//! - [`smallfs`] — the small-file store, the reference data type
//! - [`config`] — layered configuration
//!
//! The flow of one mutation: `DataClient` hashes the key to a shard and
//! calls that shard's master; the master's `FileShard` makes the write
//! durable, appends a `{path, data}` message to its replication log, and
//! acknowledges; each peer's `DataRelay` then ships the entry and
//! advances its persisted position only on acknowledgement.
//!
//! [`Env`]: galena_rpc::Env

pub use galena_client as client;
pub use galena_cluster as cluster;
pub use galena_config as config;
pub use galena_fabric as fabric;
pub use galena_replication as replication;
pub use galena_rpc as rpc;
pub use galena_smallfs as smallfs;
pub use galena_storage as storage;
pub use galena_types as types;

pub use galena_client::DataClient;
pub use galena_cluster::{Antenna, DataManager, DataNode};
pub use galena_config::{ConfigLoader, GalenaConfig};
pub use galena_fabric::{Fault, Future, Publisher, WorkerPool};
pub use galena_rpc::Env;
pub use galena_smallfs::FileNode;
pub use galena_types::{Addr, CallError, Priority, ShardId};
