//! The error value carried by a failed [`Future`](crate::Future).
//!
//! A future's failure must be observable by any number of error callbacks
//! and waiters, so the underlying error is reference-counted. [`Fault`]
//! wraps an `anyhow::Error` behind an `Arc` and exposes downcasting, which
//! lets module boundaries recover their typed error (e.g. the wire
//! taxonomy) from a fault that crossed the fabric.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::Duration;

/// A clonable, type-erased error.
#[derive(Clone)]
pub struct Fault(Arc<anyhow::Error>);

impl Fault {
    /// Wraps a concrete error.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(err)))
    }

    /// A fault carrying only a message.
    pub fn msg(msg: impl Display) -> Self {
        Self(Arc::new(anyhow::anyhow!("{msg}")))
    }

    /// The fault raised by a timed-out [`Future::wait`](crate::Future::wait).
    pub fn timeout(after: Duration) -> Self {
        Self::new(WaitTimeout { after })
    }

    /// Aggregates the failures of a parallel fan-out.
    pub fn aggregate(faults: Vec<Fault>) -> Self {
        Self::new(FaultList { faults })
    }

    /// Attempts to view the underlying error as a `T`.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        self.0.downcast_ref::<T>()
    }

    pub fn is_timeout(&self) -> bool {
        self.downcast_ref::<WaitTimeout>().is_some()
    }

    /// The individual faults of an aggregate failure, if this is one.
    pub fn fault_list(&self) -> Option<&[Fault]> {
        self.downcast_ref::<FaultList>().map(|l| l.faults.as_slice())
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// Raised in a waiter when the wait deadline passes. The underlying work
/// continues; only the wait gives up.
#[derive(Debug, thiserror::Error)]
#[error("future wait timed out after {after:?}")]
pub struct WaitTimeout {
    pub after: Duration,
}

/// The aggregate failure of a parallel fan-out: one fault per failed task,
/// in submission order. Successful results are discarded.
#[derive(Debug, thiserror::Error)]
#[error("{} parallel task(s) failed", faults.len())]
pub struct FaultList {
    pub faults: Vec<Fault>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn downcast_recovers_the_typed_error() {
        let fault = Fault::new(Boom(7));
        assert_eq!(fault.downcast_ref::<Boom>(), Some(&Boom(7)));
        assert!(fault.downcast_ref::<WaitTimeout>().is_none());
    }

    #[test]
    fn clones_share_the_error() {
        let fault = Fault::msg("shared");
        let other = fault.clone();
        assert_eq!(fault.to_string(), other.to_string());
    }

    #[test]
    fn timeout_marker() {
        assert!(Fault::timeout(Duration::from_secs(1)).is_timeout());
        assert!(!Fault::msg("no").is_timeout());
    }

    #[test]
    fn aggregate_preserves_member_faults() {
        let agg = Fault::aggregate(vec![Fault::new(Boom(1)), Fault::new(Boom(2))]);
        let list = agg.fault_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].downcast_ref::<Boom>(), Some(&Boom(2)));
    }
}
