//! # galena-replication: the replication engine
//!
//! The machinery that moves one shard's mutations to its peers:
//!
//! - [`DataRelay`] — the persistent three-state catch-up/stream machine
//!   that brings one peer (new or lagging) up to date, then keeps it in
//!   sync; crash-safe and resumable from its persisted record alone
//! - [`RepLog`] — a shard's replication log: a [`DataArray`] coupled to a
//!   persistent set of per-peer relays kept in a `CapDict`
//! - [`ShardCore`] — one shard's durable home: the replication log plus
//!   peer membership, wired to the data type through [`RelaySource`]
//!
//! Delivery guarantees: per peer, entries arrive in strictly increasing
//! sequence order, exactly once (a relay's persisted position never passes
//! an unacknowledged sequence); during initial copy, a snapshot taken at
//! sequence `S` is delivered after every log entry below `S` and before
//! any at or above it.

pub mod relay;
pub mod rep_log;
pub mod shard;

pub use relay::{DataRelay, RelayCtx, RelayPhase, RelaySource, register_relay_factory};
pub use rep_log::RepLog;
pub use shard::ShardCore;
