//! Core isolation primitives: sibling rendezvous, scoped pause/resume,
//! the core-claim registry and socket-scoped load locks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::hw::{CpuId, SiblingScheduler, SocketId};

#[derive(Debug, Default)]
struct Arrivals {
    arrived: usize,
    abandoned: bool,
}

/// One-shot meeting point for every sibling thread of a core.
///
/// Either every participant observes success, or every participant that
/// has not yet left observes failure once the wait bound expires.
#[derive(Debug)]
pub struct Rendezvous {
    expected: usize,
    arrivals: Mutex<Arrivals>,
    all_arrived: Condvar,
}

impl Rendezvous {
    /// Rendezvous for `expected` participants.
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            arrivals: Mutex::new(Arrivals::default()),
            all_arrived: Condvar::new(),
        }
    }

    /// Arrives and waits up to `timeout` for the others.
    ///
    /// Returns `false` when the rendezvous was abandoned.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut arrivals = self
            .arrivals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if arrivals.abandoned {
            return false;
        }
        arrivals.arrived += 1;
        if arrivals.arrived >= self.expected {
            self.all_arrived.notify_all();
            return true;
        }
        loop {
            if arrivals.arrived >= self.expected {
                return true;
            }
            if arrivals.abandoned {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                arrivals.abandoned = true;
                self.all_arrived.notify_all();
                return false;
            }
            arrivals = self
                .all_arrived
                .wait_timeout(arrivals, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Marks the rendezvous as failed, releasing anyone waiting.
    pub fn abandon(&self) {
        let mut arrivals = self
            .arrivals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if arrivals.arrived < self.expected {
            arrivals.abandoned = true;
        }
        self.all_arrived.notify_all();
    }
}

/// Keeps a set of sibling CPUs paused for the guard's lifetime.
pub struct Isolation<'a> {
    scheduler: &'a dyn SiblingScheduler,
    cpus: &'a [CpuId],
}

impl<'a> Isolation<'a> {
    /// Pauses `cpus`; they are resumed when the guard drops.
    #[must_use]
    pub fn enter(scheduler: &'a dyn SiblingScheduler, cpus: &'a [CpuId]) -> Self {
        trace!(?cpus, "isolating siblings");
        scheduler.pause(cpus);
        Self { scheduler, cpus }
    }
}

impl Drop for Isolation<'_> {
    fn drop(&mut self) {
        trace!(cpus = ?self.cpus, "resuming siblings");
        self.scheduler.resume(self.cpus);
    }
}

/// Registry of physical cores currently under test.
#[derive(Debug, Default)]
pub struct CoreClaims {
    busy: Mutex<HashSet<CpuId>>,
}

impl CoreClaims {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the core identified by its first sibling, or returns `None`
    /// when the core is already claimed.
    pub fn claim(&self, core: CpuId) -> Option<CoreClaim<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        busy.insert(core).then_some(CoreClaim { claims: self, core })
    }

    /// Returns true when `core` is claimed.
    #[must_use]
    pub fn is_claimed(&self, core: CpuId) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&core)
    }
}

/// Ownership of one core; released on drop.
#[derive(Debug)]
pub struct CoreClaim<'a> {
    claims: &'a CoreClaims,
    core: CpuId,
}

impl CoreClaim<'_> {
    /// Claimed core.
    #[must_use]
    pub const fn core(&self) -> CpuId {
        self.core
    }
}

impl Drop for CoreClaim<'_> {
    fn drop(&mut self) {
        self.claims
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.core);
    }
}

/// One lock per socket, shared by every test type loading on that socket.
#[derive(Debug, Default)]
pub struct SocketLocks {
    locks: Mutex<HashMap<SocketId, Arc<Mutex<()>>>>,
}

impl SocketLocks {
    /// Empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `socket`.
    pub fn with_socket<R>(&self, socket: SocketId, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(socket).or_default())
        };
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}
