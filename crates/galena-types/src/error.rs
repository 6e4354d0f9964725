//! The wire error taxonomy.
//!
//! Every cross-replica call in Galena resolves to `Result<T, CallError>`:
//! the retry helpers at the client boundary match on the variant rather than
//! catching exceptions. The variants mirror what the RPC substrate can
//! report (`NoEndpoint`, `ObjectNotExist`) plus the routing outcomes the
//! replication layer itself produces (`NotMaster`, `NoShard`).

use thiserror::Error;

use crate::{Addr, ShardId};

/// Outcome tags for a remote (or would-be remote) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The callee believes itself a slave for the addressed shard.
    #[error("replica is not the master")]
    NotMaster,

    /// The callee does not own the shard containing the key.
    #[error("no shard for path {path:?} (shard {shard:?})")]
    NoShard {
        path: Option<String>,
        shard: Option<ShardId>,
    },

    /// The target replica is offline or unreachable.
    #[error("no endpoint for {addr}")]
    NoEndpoint { addr: Addr },

    /// The target adapter is active but no servant answers to the address.
    #[error("no object at {addr}")]
    ObjectNotExist { addr: Addr },

    /// Data-type-specific not-found; surfaced to the caller unchanged.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Precondition failure on a key (reserved prefix, traversal, ...).
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// A storage-layer failure, stringified at the servant boundary.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Anything else the callee chose to report.
    #[error("{0}")]
    Other(String),
}

impl CallError {
    /// Shorthand for a `NoShard` keyed by path.
    pub fn no_shard_for(path: &str) -> Self {
        CallError::NoShard {
            path: Some(path.to_string()),
            shard: None,
        }
    }

    /// True for errors that mean "the route was stale, re-elect and retry":
    /// the caller reached a slave, a non-owner, or a dead endpoint.
    pub fn is_stale_route(&self) -> bool {
        matches!(
            self,
            CallError::NotMaster
                | CallError::NoShard { .. }
                | CallError::NoEndpoint { .. }
                | CallError::ObjectNotExist { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_route_classification() {
        assert!(CallError::NotMaster.is_stale_route());
        assert!(CallError::no_shard_for("fred").is_stale_route());
        assert!(
            CallError::NoEndpoint {
                addr: Addr::new("file@SmallFS-node1.SmallFSRep")
            }
            .is_stale_route()
        );
        assert!(!CallError::NotFound { path: "fred".into() }.is_stale_route());
        assert!(!CallError::Storage("disk on fire".into()).is_stale_route());
    }
}
