//! # galena-rpc: the abstract RPC boundary
//!
//! The replication core never talks to a wire directly; it goes through the
//! traits here. A [`Grid`] resolves addresses to typed proxies and answers
//! replica-group queries; proxies carry the servant interfaces
//! ([`StoreApi`], [`ManagerApi`], [`AntennaApi`]). A production deployment
//! backs these with a real RPC runtime; tests back them with the in-memory
//! loopback grid from `galena-test-harness`.
//!
//! [`Env`] is the per-process bundle of ambient resources — grid handle,
//! data root, server id, worker pool, event bus — threaded explicitly
//! through every component.
//!
//! Transport failures surface as [`CallError`] tags, never as panics:
//! a proxy call on a dead endpoint returns `CallError::NoEndpoint`, and an
//! asynchronous update fails its future with a fault wrapping the same tag.

pub mod api;
pub mod env;

pub use api::{AntennaApi, Grid, ManagerApi, Replicated, StoreApi, UpdateSink};
pub use env::Env;

use galena_fabric::Fault;
use galena_types::CallError;

/// Wraps a call error for transport through a future.
pub fn fault_from_call(err: CallError) -> Fault {
    Fault::new(err)
}

/// Recovers the call error from a fault that crossed the fabric; anything
/// unrecognized comes back as `CallError::Other`.
pub fn call_from_fault(fault: &Fault) -> CallError {
    fault
        .downcast_ref::<CallError>()
        .cloned()
        .unwrap_or_else(|| CallError::Other(fault.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_errors_round_trip_through_faults() {
        let fault = fault_from_call(CallError::NotMaster);
        assert_eq!(call_from_fault(&fault), CallError::NotMaster);
    }

    #[test]
    fn foreign_faults_become_other() {
        let fault = Fault::msg("socket melted");
        assert!(matches!(call_from_fault(&fault), CallError::Other(m) if m.contains("melted")));
    }
}
