//! Master election and master-aware routing.
//!
//! Election is ad-hoc and stateless on the wire: every replica answers
//! `master_state` with its priority vector, and whoever compares highest
//! under lexicographic order is the master (or master-elect). A replica
//! that discovers itself the winner self-promotes by setting the leading
//! slot of its own vector; the manager's published master map is the
//! persisted source of truth that demotes a concurrent loser on the next
//! refresh.
//!
//! [`MasterRouter`] is the caller side: it caches the elected master per
//! group and retries exactly once after re-electing on `NotMaster`, a
//! dead endpoint, or a missing servant.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use galena_rpc::{Env, ManagerApi, Replicated};
use galena_types::{Addr, CallError, Priority};
use rand::Rng;

/// Picks the lexicographically-highest priority among reachable replicas.
pub fn choose_master(candidates: Vec<(Addr, Priority)>) -> Option<(Addr, Priority)> {
    candidates
        .into_iter()
        .max_by(|(_, a), (_, b)| a.cmp(b))
}

type Resolver<P> = Box<dyn Fn(&Env, &Addr) -> Arc<P> + Send + Sync>;

/// Servant-side election state: the priority vector `[is_master, random]`
/// and the self-promotion protocol.
pub struct MasterOrSlave {
    env: Env,
    group: Addr,
    self_addr: Addr,
    tiebreak: i64,
    is_master: AtomicBool,
    resolve: Resolver<dyn Replicated>,
}

impl MasterOrSlave {
    /// Election state for a servant in `group`, probing peers through
    /// `resolve`. The random tiebreaker is drawn once, here.
    pub fn new(
        env: &Env,
        group: Addr,
        resolve: impl Fn(&Env, &Addr) -> Arc<dyn Replicated> + Send + Sync + 'static,
    ) -> Self {
        let self_addr = group.replica_on(env.node_name());
        Self {
            env: env.clone(),
            group,
            self_addr,
            tiebreak: rand::thread_rng().gen_range(0..i64::MAX),
            is_master: AtomicBool::new(false),
            resolve: Box::new(resolve),
        }
    }

    /// Election state for a manager-group servant.
    pub fn manager(env: &Env, group: Addr) -> Self {
        Self::new(env, group, |env, addr| {
            env.manager_proxy(addr) as Arc<dyn Replicated>
        })
    }

    pub fn self_addr(&self) -> &Addr {
        &self.self_addr
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    /// The current priority vector: `[is_master, random_tiebreaker]`.
    pub fn master_state(&self) -> Priority {
        Priority::new(vec![i64::from(self.is_master()), self.tiebreak])
    }

    /// Queries every sibling, drops the unreachable, and compares vectors.
    /// If this replica wins it self-promotes. Returns the master address.
    pub fn find_master(&self) -> Result<Addr, CallError> {
        let mut best: Option<(Addr, Priority)> = None;
        for addr in self.env.replicas(&self.group, true)? {
            if addr == self.self_addr {
                continue;
            }
            let proxy = (self.resolve)(&self.env, &addr);
            match proxy.master_state() {
                Ok(priority) => {
                    if best.as_ref().is_none_or(|(_, b)| priority > *b) {
                        best = Some((addr, priority));
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "replica unreachable during election");
                }
            }
        }
        match best {
            Some((addr, priority)) if priority > self.master_state() => Ok(addr),
            _ => {
                if !self.is_master.swap(true, Ordering::SeqCst) {
                    tracing::info!(addr = %self.self_addr, "self-promoted to master");
                }
                Ok(self.self_addr.clone())
            }
        }
    }

    /// Succeeds iff this replica is (or just became) the master.
    pub fn assert_master(&self) -> Result<(), CallError> {
        if self.is_master() {
            return Ok(());
        }
        self.find_master()?;
        if self.is_master() {
            Ok(())
        } else {
            Err(CallError::NotMaster)
        }
    }
}

/// Caller-side master cache for one replica group; see the module docs.
pub struct MasterRouter<P: ?Sized> {
    group: Addr,
    resolve: Resolver<P>,
    cached: Mutex<Option<(Addr, Arc<P>)>>,
}

impl MasterRouter<dyn ManagerApi> {
    /// A router over a manager group.
    pub fn manager(group: Addr) -> Self {
        Self::new(group, |env, addr| env.manager_proxy(addr))
    }
}

impl<P: ?Sized + Replicated + 'static> MasterRouter<P> {
    pub fn new(
        group: Addr,
        resolve: impl Fn(&Env, &Addr) -> Arc<P> + Send + Sync + 'static,
    ) -> Self {
        Self {
            group,
            resolve: Box::new(resolve),
            cached: Mutex::new(None),
        }
    }

    pub fn group(&self) -> &Addr {
        &self.group
    }

    /// Drops the cached master; the next call re-elects.
    pub fn invalidate(&self) {
        *self.cached.lock().expect("router lock poisoned") = None;
    }

    /// The cached master proxy, electing if the cache is cold.
    pub fn master(&self, env: &Env) -> Result<Arc<P>, CallError> {
        {
            let cached = self.cached.lock().expect("router lock poisoned");
            if let Some((_, proxy)) = cached.as_ref() {
                return Ok(Arc::clone(proxy));
            }
        }
        let (addr, proxy) = self.elect(env)?;
        *self.cached.lock().expect("router lock poisoned") = Some((addr, Arc::clone(&proxy)));
        Ok(proxy)
    }

    fn elect(&self, env: &Env) -> Result<(Addr, Arc<P>), CallError> {
        let mut best: Option<(Addr, Priority, Arc<P>)> = None;
        for addr in env.replicas(&self.group, true)? {
            let proxy = (self.resolve)(env, &addr);
            match proxy.master_state() {
                Ok(priority) => {
                    if best.as_ref().is_none_or(|(_, b, _)| priority > *b) {
                        best = Some((addr, priority, proxy));
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "replica unreachable during election");
                }
            }
        }
        let (addr, _, proxy) = best.ok_or_else(|| CallError::NoEndpoint {
            addr: self.group.clone(),
        })?;
        Ok((addr, proxy))
    }

    /// Calls `op` on the master; on a stale route (`NotMaster`, dead
    /// endpoint, missing servant) re-elects and retries exactly once.
    pub fn call<T>(
        &self,
        env: &Env,
        op: impl Fn(&P) -> Result<T, CallError>,
    ) -> Result<T, CallError> {
        let master = self.master(env)?;
        match op(&master) {
            Err(e) if e.is_stale_route() => {
                tracing::debug!(group = %self.group, error = %e, "stale master, re-electing");
                self.invalidate();
                let master = self.master(env)?;
                op(&master)
            }
            outcome => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(s: &str) -> Addr {
        Addr::new(s)
    }

    #[test]
    fn choose_master_takes_the_lexicographic_maximum() {
        let winner = choose_master(vec![
            (a("x@G-n1.GRep"), Priority::new(vec![0, 1, 10])),
            (a("x@G-n2.GRep"), Priority::new(vec![1, 0, 2])),
            (a("x@G-n3.GRep"), Priority::new(vec![0, 1, 900])),
        ])
        .unwrap();
        assert_eq!(winner.0, a("x@G-n2.GRep"));
    }

    #[test]
    fn choose_master_of_nothing_is_none() {
        assert_eq!(choose_master(Vec::new()), None);
    }

    #[test]
    fn an_established_master_beats_any_tiebreak() {
        // The leading slot dominates: an acting master never loses to a
        // bigger random.
        let master = Priority::new(vec![1, 0]);
        let pretender = Priority::new(vec![0, i64::MAX]);
        assert!(master > pretender);
    }
}
