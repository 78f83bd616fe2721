//! Collaborator contracts: register access, CPU topology and sibling scheduling.
//!
//! Everything the controller needs from the machine goes through these three
//! traits, so that tests and the simulator can stand in for real hardware.

use thiserror::Error;

/// Logical CPU number.
pub type CpuId = u32;

/// Physical package (socket) number.
pub type SocketId = u32;

/// Register access failure reported by a [`HardwareChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HwError {
    /// Reading the register raised a fault.
    #[error("read of register {reg:#x} faulted on cpu {cpu}")]
    ReadFault {
        /// Logical CPU the read was issued on.
        cpu: CpuId,
        /// Register number.
        reg: u32,
    },
    /// Writing the register raised a fault.
    #[error("write of {value:#x} to register {reg:#x} faulted on cpu {cpu}")]
    WriteFault {
        /// Logical CPU the write was issued on.
        cpu: CpuId,
        /// Register number.
        reg: u32,
        /// Value that was being written.
        value: u64,
    },
}

/// Per-logical-CPU register access.
///
/// Writes are addressed to one logical CPU; registers such as the activate
/// register only take effect once every sibling of the physical core has
/// written them.
pub trait HardwareChannel: Send + Sync {
    /// Reads a 64-bit register on `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`HwError::ReadFault`] when the access faults.
    fn read(&self, cpu: CpuId, reg: u32) -> Result<u64, HwError>;

    /// Writes a 64-bit register on `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`HwError::WriteFault`] when the access faults.
    fn write(&self, cpu: CpuId, reg: u32, value: u64) -> Result<(), HwError>;
}

/// CPU topology queries.
pub trait CoreTopology: Send + Sync {
    /// All logical CPUs of the physical core containing `cpu`, including `cpu`.
    /// Empty when `cpu` is unknown.
    fn siblings_of(&self, cpu: CpuId) -> Vec<CpuId>;

    /// Whether `cpu` is online.
    fn is_online(&self, cpu: CpuId) -> bool;

    /// Package containing `cpu`, or `None` when unknown.
    fn socket_of(&self, cpu: CpuId) -> Option<SocketId>;

    /// Every online logical CPU in ascending order.
    fn online_cpus(&self) -> Vec<CpuId>;
}

/// Takes sibling CPUs away from normal scheduling for the length of a test round.
pub trait SiblingScheduler: Send + Sync {
    /// Stops ordinary work on `cpus`.
    fn pause(&self, cpus: &[CpuId]);

    /// Returns `cpus` to ordinary work.
    fn resume(&self, cpus: &[CpuId]);
}

/// Scheduler for hosts where the caller already owns the sibling threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScheduler;

impl SiblingScheduler for NoopScheduler {
    fn pause(&self, _cpus: &[CpuId]) {}

    fn resume(&self, _cpus: &[CpuId]) {}
}

/// First online CPU of every socket, in socket order.
#[must_use]
pub fn socket_leaders(topology: &dyn CoreTopology) -> Vec<(SocketId, CpuId)> {
    let mut leaders: Vec<(SocketId, CpuId)> = Vec::new();
    for cpu in topology.online_cpus() {
        let Some(socket) = topology.socket_of(cpu) else {
            continue;
        };
        if !leaders.iter().any(|(known, _)| *known == socket) {
            leaders.push((socket, cpu));
        }
    }
    leaders.sort_unstable();
    leaders
}

#[cfg(test)]
mod tests {
    use super::{socket_leaders, CoreTopology, CpuId, SocketId};

    struct TwoSockets;

    impl CoreTopology for TwoSockets {
        fn siblings_of(&self, cpu: CpuId) -> Vec<CpuId> {
            vec![cpu & !1, cpu | 1]
        }

        fn is_online(&self, cpu: CpuId) -> bool {
            cpu != 0
        }

        fn socket_of(&self, cpu: CpuId) -> Option<SocketId> {
            (cpu < 8).then_some(cpu / 4)
        }

        fn online_cpus(&self) -> Vec<CpuId> {
            (1..8).collect()
        }
    }

    #[test]
    fn leaders_are_first_online_cpu_per_socket() {
        assert_eq!(socket_leaders(&TwoSockets), vec![(0, 1), (1, 4)]);
    }
}
