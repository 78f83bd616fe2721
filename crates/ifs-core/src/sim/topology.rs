//! Regular socket/core/thread topology with switchable CPUs.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use crate::hw::{CoreTopology, CpuId, SocketId};

/// CPUs are numbered socket-major: `((socket * cores) + core) * threads + thread`.
#[derive(Debug)]
pub struct SimTopology {
    sockets: u32,
    cores_per_socket: u32,
    threads_per_core: u32,
    offline: Mutex<BTreeSet<CpuId>>,
}

impl SimTopology {
    /// Builds a topology; zero counts are raised to one.
    #[must_use]
    pub fn new(sockets: u32, cores_per_socket: u32, threads_per_core: u32) -> Self {
        Self {
            sockets: sockets.max(1),
            cores_per_socket: cores_per_socket.max(1),
            threads_per_core: threads_per_core.max(1),
            offline: Mutex::new(BTreeSet::new()),
        }
    }

    /// Number of logical CPUs, saturating at `u32::MAX`.
    #[must_use]
    pub const fn cpu_count(&self) -> u32 {
        self.sockets
            .saturating_mul(self.cores_per_socket)
            .saturating_mul(self.threads_per_core)
    }

    /// Number of sockets.
    #[must_use]
    pub const fn sockets(&self) -> u32 {
        self.sockets
    }

    /// Lowest CPU of the physical core containing `cpu`.
    #[must_use]
    pub const fn core_of(&self, cpu: CpuId) -> CpuId {
        cpu - cpu % self.threads_per_core
    }

    /// Takes `cpu` offline or brings it back. Returns false for unknown CPUs.
    pub fn set_online(&self, cpu: CpuId, online: bool) -> bool {
        if cpu >= self.cpu_count() {
            return false;
        }
        let mut offline = self.offline.lock().unwrap_or_else(PoisonError::into_inner);
        if online {
            offline.remove(&cpu);
        } else {
            offline.insert(cpu);
        }
        true
    }
}

impl CoreTopology for SimTopology {
    fn siblings_of(&self, cpu: CpuId) -> Vec<CpuId> {
        if cpu >= self.cpu_count() {
            return Vec::new();
        }
        let first = self.core_of(cpu);
        (first..first.saturating_add(self.threads_per_core)).collect()
    }

    fn is_online(&self, cpu: CpuId) -> bool {
        cpu < self.cpu_count()
            && !self
                .offline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&cpu)
    }

    fn socket_of(&self, cpu: CpuId) -> Option<SocketId> {
        let per_socket = self.cores_per_socket.saturating_mul(self.threads_per_core);
        (cpu < self.cpu_count()).then(|| cpu / per_socket)
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        let offline = self.offline.lock().unwrap_or_else(PoisonError::into_inner);
        (0..self.cpu_count())
            .filter(|cpu| !offline.contains(cpu))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SimTopology;
    use crate::hw::{socket_leaders, CoreTopology};

    #[test]
    fn numbering_is_socket_major() {
        let topology = SimTopology::new(2, 2, 2);
        assert_eq!(topology.cpu_count(), 8);
        assert_eq!(topology.siblings_of(5), vec![4, 5]);
        assert_eq!(topology.socket_of(3), Some(0));
        assert_eq!(topology.socket_of(4), Some(1));
        assert_eq!(topology.socket_of(8), None);
        assert!(topology.siblings_of(8).is_empty());
    }

    #[test]
    fn offline_cpus_move_socket_leader() {
        let topology = SimTopology::new(2, 2, 2);
        assert!(topology.set_online(0, false));
        assert!(!topology.is_online(0));
        assert_eq!(socket_leaders(&topology), vec![(0, 1), (1, 4)]);
        assert!(topology.set_online(0, true));
        assert_eq!(socket_leaders(&topology), vec![(0, 0), (1, 4)]);
        assert!(!topology.set_online(99, false));
    }

    #[test]
    fn oversized_shapes_saturate_instead_of_overflowing() {
        let topology = SimTopology::new(65_536, 65_536, 2);
        assert_eq!(topology.cpu_count(), u32::MAX);
        assert_eq!(topology.socket_of(0), Some(0));
        assert_eq!(topology.siblings_of(u32::MAX - 1), vec![u32::MAX - 1]);
    }
}
