//! # galena-types: Core types for Galena
//!
//! This crate contains shared types used across the Galena system:
//! - Proxy addresses ([`Addr`])
//! - Shard identifiers and key hashing ([`ShardId`], [`key_hash`])
//! - Master-election priority vectors ([`Priority`])
//! - Published replication state ([`NodeState`], [`ShardState`], [`MasterMap`])
//! - The wire error taxonomy ([`CallError`])
//!
//! Everything here is plain data: no I/O, no threads. The crates that move
//! bytes around (`galena-storage`, `galena-replication`, `galena-cluster`)
//! all speak in these types.

pub mod error;
pub mod state;

pub use error::CallError;
pub use state::{MasterMap, NodeState, ShardState};

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Addresses
// ============================================================================

/// A proxy address: the stable string identity of a servant.
///
/// The canonical form is `name@adapter`, where `adapter` is either a concrete
/// adapter id (`<server>-<node>.<adapter>`) or a replica group name
/// (`<base>Group`). Addresses are compared as strings; two replicas are the
/// same peer iff their addresses are equal.
///
/// # Examples
///
/// ```
/// # use galena_types::Addr;
/// let group = Addr::new("file@SmallFSGroup");
/// assert!(group.is_group());
///
/// let replica = group.replica_on("node1");
/// assert_eq!(replica.as_str(), "file@SmallFS-node1.SmallFSRep");
/// assert_eq!(replica.server_id(), "SmallFS-node1");
/// assert_eq!(replica.node(), "node1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Addr(String);

impl Addr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The object name: everything before the `@`.
    pub fn name(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }

    /// The adapter id: everything after the `@`.
    pub fn adapter(&self) -> &str {
        self.0.split_once('@').map_or("", |(_, a)| a)
    }

    /// True if this address names a replica group rather than one replica.
    pub fn is_group(&self) -> bool {
        self.adapter().ends_with("Group")
    }

    /// The server id of a concrete replica address: the adapter up to the
    /// first `.` (e.g. `SmallFS-node1`). For a group address this is the
    /// whole adapter.
    pub fn server_id(&self) -> &str {
        self.adapter().split('.').next().unwrap_or("")
    }

    /// The node part of the server id (after the last `-`).
    pub fn node(&self) -> &str {
        self.server_id().rsplit('-').next().unwrap_or("")
    }

    /// For a group address `<name>@<base>Group`, the address of the replica
    /// on the given node: `<name>@<base>-<node>.<base>Rep`.
    ///
    /// # Panics
    ///
    /// Panics if this address is not a group address.
    pub fn replica_on(&self, node: &str) -> Addr {
        let adapter = self.adapter();
        let base = adapter
            .strip_suffix("Group")
            .expect("replica_on requires a group address");
        Addr::new(format!("{}@{base}-{node}.{base}Rep", self.name()))
    }

    /// The antenna address on the same adapter as this replica.
    pub fn antenna(&self) -> Addr {
        Addr::new(format!("antenna@{}", self.adapter()))
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Addr {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Addr {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Shards and key hashing
// ============================================================================

/// An 8-bit hash of a key, used to place the key in a shard.
///
/// FNV-1a over the key bytes, folded down to one byte by xoring the eight
/// bytes of the 64-bit state together.
pub fn key_hash(key: &str) -> u8 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = FNV_OFFSET;
    for b in key.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h.to_le_bytes().iter().fold(0, |acc, b| acc ^ b)
}

/// The little-endian bit string of an 8-bit hash (`bit 0` first).
pub fn hash_bits(hash: u8) -> String {
    (0..8).map(|i| if hash >> i & 1 == 1 { '1' } else { '0' }).collect()
}

/// A shard identifier: a string of 0 to 8 bits written as `'0'`/`'1'`.
///
/// Key `k` belongs to shard `s` iff `s` is a prefix of the little-endian bit
/// string of `key_hash(k)`. The empty shard `""` matches every key. A set of
/// shards partitions the key space when every 8-bit value has exactly one
/// matching shard.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// The all-keys shard `""`.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parses a shard id, rejecting anything but 0..=8 `'0'`/`'1'` chars.
    pub fn parse(bits: &str) -> Result<Self, CallError> {
        if bits.len() > 8 || bits.bytes().any(|b| b != b'0' && b != b'1') {
            return Err(CallError::Other(format!("invalid shard id {bits:?}")));
        }
        Ok(Self(bits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if the given 8-bit hash falls in this shard.
    pub fn covers(&self, hash: u8) -> bool {
        self.0.as_str() == &hash_bits(hash)[..self.0.len()]
    }

    /// True if this shard contains the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.covers(key_hash(key))
    }

    /// The on-disk directory name for this shard (`S<bits>`).
    pub fn dir_name(&self) -> String {
        format!("S{}", self.0)
    }

    /// Recovers a shard id from a directory name written by [`Self::dir_name`].
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let bits = name.strip_prefix('S')?;
        Self::parse(bits).ok()
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    /// Convenience for literals in tests and factories.
    ///
    /// # Panics
    ///
    /// Panics on a malformed shard id; use [`ShardId::parse`] for input that
    /// is not known-good.
    fn from(value: &str) -> Self {
        Self::parse(value).expect("malformed shard id literal")
    }
}

// ============================================================================
// Priority vectors
// ============================================================================

/// A master-election priority vector: signed 64-bit integers compared
/// lexicographically, higher wins.
///
/// The conventional layout for a shard replica is
/// `[is_master (0|1), used_before (0|1), random_tiebreaker]`; the bare
/// `MasterOrSlave` servant uses `[is_master, random_tiebreaker]`. Only the
/// first slot is ever rewritten after construction.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Priority(Vec<i64>);

impl Priority {
    pub fn new(slots: Vec<i64>) -> Self {
        Self(slots)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    /// True if the leading slot marks this replica as master.
    pub fn is_master(&self) -> bool {
        self.0.first().copied() == Some(1)
    }

    /// Rewrites the leading (master) slot.
    pub fn set_master(&mut self, is_master: bool) {
        if let Some(slot) = self.0.first_mut() {
            *slot = i64::from(is_master);
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<i64>> for Priority {
    fn from(slots: Vec<i64>) -> Self {
        Self(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn addr_parts() {
        let a = Addr::new("file@SmallFS-node2.SmallFSRep");
        assert_eq!(a.name(), "file");
        assert_eq!(a.adapter(), "SmallFS-node2.SmallFSRep");
        assert_eq!(a.server_id(), "SmallFS-node2");
        assert_eq!(a.node(), "node2");
        assert!(!a.is_group());
    }

    #[test]
    fn group_addr_expands_to_replica() {
        let g = Addr::new("file@SmallFSGroup");
        assert!(g.is_group());
        assert_eq!(
            g.replica_on("node3"),
            Addr::new("file@SmallFS-node3.SmallFSRep")
        );
    }

    #[test]
    fn antenna_addr_shares_the_adapter() {
        let a = Addr::new("file@SmallFS-node1.SmallFSRep");
        assert_eq!(a.antenna().as_str(), "antenna@SmallFS-node1.SmallFSRep");
    }

    #[test_case("", 0b0000_0000, true; "root matches zero")]
    #[test_case("", 0b1111_1111, true; "root matches everything")]
    #[test_case("0", 0b0000_0010, true; "low bit clear")]
    #[test_case("0", 0b0000_0011, false; "low bit set")]
    #[test_case("10", 0b0000_0001, true; "two-bit prefix")]
    #[test_case("10", 0b0000_0011, false; "two-bit mismatch")]
    fn shard_cover(bits: &str, hash: u8, expected: bool) {
        assert_eq!(ShardId::from(bits).covers(hash), expected);
    }

    #[test]
    fn hash_bits_is_little_endian() {
        assert_eq!(hash_bits(0b0000_0001), "10000000");
        assert_eq!(hash_bits(0b1000_0000), "00000001");
    }

    #[test]
    fn sibling_shards_partition_the_hash_space() {
        let shards = [ShardId::from("0"), ShardId::from("01"), ShardId::from("11")];
        for h in 0..=255u8 {
            let matching = shards.iter().filter(|s| s.covers(h)).count();
            assert_eq!(matching, 1, "hash {h:#010b}");
        }
    }

    #[test]
    fn shard_dir_round_trip() {
        let s = ShardId::from("10");
        assert_eq!(s.dir_name(), "S10");
        assert_eq!(ShardId::from_dir_name("S10"), Some(s));
        assert_eq!(ShardId::from_dir_name("S"), Some(ShardId::root()));
        assert_eq!(ShardId::from_dir_name(".rep"), None);
    }

    #[test]
    fn shard_id_rejects_garbage() {
        assert!(ShardId::parse("012").is_err());
        assert!(ShardId::parse("111111111").is_err());
    }

    #[test]
    fn priority_orders_lexicographically() {
        let slave = Priority::new(vec![0, 1, 500]);
        let master = Priority::new(vec![1, 0, 2]);
        let fresh = Priority::new(vec![0, 0, i64::MAX]);
        assert!(master > slave);
        assert!(slave > fresh);
    }

    #[test]
    fn priority_master_slot() {
        let mut p = Priority::new(vec![0, 1, 42]);
        assert!(!p.is_master());
        p.set_master(true);
        assert!(p.is_master());
        assert_eq!(p.as_slice(), &[1, 1, 42]);
    }

    #[test]
    fn key_hash_is_stable() {
        // The placement of existing data depends on these values.
        assert_eq!(key_hash("fred"), key_hash("fred"));
        assert_ne!(key_hash("fred"), key_hash("barney"));
    }
}
