//! # galena-cluster: election, shard containers, and the control plane
//!
//! The coordination layer above the replication engine:
//!
//! - [`MasterOrSlave`] and [`MasterRouter`] — priority-vector election
//!   within a replica group: servants self-promote when they win, callers
//!   cache the master and retry exactly once on a stale route
//! - [`DataNode`] — a typed collection of shards on one replica:
//!   registration with the manager, shard lifecycle, master-map refresh,
//!   online-notification handling
//! - [`DataManager`] — the master-elected control plane that registers new
//!   replicas, links and unlinks peers across the group, and publishes the
//!   master-per-shard map
//! - [`Antenna`] — the online-notification servant and broadcast

pub mod antenna;
pub mod manager;
pub mod master;
pub mod node;

pub use antenna::{Antenna, notify_online};
pub use manager::DataManager;
pub use master::{MasterOrSlave, MasterRouter, choose_master};
pub use node::{DataNode, Shard, ShardFactory, ShardSlot};
