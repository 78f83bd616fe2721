//! Deterministic software model of the test hardware and its collaborators.
//!
//! Built with the `sim` feature for integration tests and the `ifs-ctl`
//! driver. Faults are injected through [`SimHardware::update_faults`].

/// Staging memory and simulated firmware provider.
pub mod firmware;
/// Register-level hardware model.
pub mod hardware;
/// Socket/core/thread topology.
pub mod topology;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub use firmware::{HashBlob, SimFirmware, SimImageSpec, SimMemory};
pub use hardware::{AuthFault, SbafInterrupt, ScanInterrupt, SimFaults, SimHardware};
pub use topology::SimTopology;

use crate::config::IfsConfig;
use crate::controller::Platform;
use crate::hw::{CoreTopology, CpuId, HardwareChannel, SiblingScheduler};
use crate::image::{CpuSignature, FirmwareProvider};
use crate::msr::{ArrayGeneration, Generation, TestKind};

/// Scheduler that records isolation requests.
#[derive(Debug, Default)]
pub struct SimScheduler {
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    paused: Mutex<Vec<CpuId>>,
}

impl SimScheduler {
    /// Fresh scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pause requests.
    #[must_use]
    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    /// Number of resume requests.
    #[must_use]
    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// CPUs currently paused.
    #[must_use]
    pub fn paused(&self) -> Vec<CpuId> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SiblingScheduler for SimScheduler {
    fn pause(&self, cpus: &[CpuId]) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(cpus);
    }

    fn resume(&self, cpus: &[CpuId]) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|cpu| !cpus.contains(cpu));
    }
}

/// Machine shape for [`Simulator::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSpec {
    /// Processor signature.
    pub signature: CpuSignature,
    /// Packages.
    pub sockets: u32,
    /// Physical cores per package.
    pub cores_per_socket: u32,
    /// Logical CPUs per core.
    pub threads_per_core: u32,
    /// Scan register generation.
    pub generation: Generation,
    /// Array-BIST generation.
    pub array_generation: ArrayGeneration,
    /// Test types advertised in the capabilities register.
    pub kinds: Vec<TestKind>,
}

impl SimSpec {
    /// Largest machine the simulator models.
    pub const MAX_CPUS: u32 = 4096;

    /// Logical CPUs of this shape, or `None` when it exceeds [`Self::MAX_CPUS`].
    #[must_use]
    pub fn cpu_count(&self) -> Option<u32> {
        self.sockets
            .max(1)
            .checked_mul(self.cores_per_socket.max(1))
            .and_then(|cpus| cpus.checked_mul(self.threads_per_core.max(1)))
            .filter(|&cpus| cpus <= Self::MAX_CPUS)
    }
}

impl Default for SimSpec {
    fn default() -> Self {
        Self {
            signature: CpuSignature::new(0x06, 0x8f, 0x06),
            sockets: 1,
            cores_per_socket: 2,
            threads_per_core: 2,
            generation: Generation::Gen0,
            array_generation: ArrayGeneration::Gen0,
            kinds: TestKind::ALL.to_vec(),
        }
    }
}

/// Every simulated collaborator, wired together.
#[derive(Debug, Clone)]
pub struct Simulator {
    /// Processor signature.
    pub signature: CpuSignature,
    /// Topology.
    pub topology: Arc<SimTopology>,
    /// Staging memory shared by firmware and hardware.
    pub memory: Arc<SimMemory>,
    /// Register model.
    pub hardware: Arc<SimHardware>,
    /// Firmware provider.
    pub firmware: Arc<SimFirmware>,
    /// Scheduler.
    pub scheduler: Arc<SimScheduler>,
}

impl Simulator {
    /// Builds a machine of the given shape with no images installed.
    #[must_use]
    pub fn new(spec: &SimSpec) -> Self {
        let topology = Arc::new(SimTopology::new(
            spec.sockets,
            spec.cores_per_socket,
            spec.threads_per_core,
        ));
        let memory = Arc::new(SimMemory::new());
        let hardware = Arc::new(SimHardware::new(
            spec.signature,
            &spec.kinds,
            spec.generation,
            spec.array_generation,
            Arc::clone(&topology),
            Arc::clone(&memory),
        ));
        let firmware = Arc::new(SimFirmware::new(spec.signature, Arc::clone(&memory)));
        Self {
            signature: spec.signature,
            topology,
            memory,
            hardware,
            firmware,
            scheduler: Arc::new(SimScheduler::new()),
        }
    }

    /// Platform backed by this simulator.
    #[must_use]
    pub fn platform(&self, config: IfsConfig) -> Arc<Platform> {
        let hw: Arc<dyn HardwareChannel> = self.hardware.clone();
        let topology: Arc<dyn CoreTopology> = self.topology.clone();
        let scheduler: Arc<dyn SiblingScheduler> = self.scheduler.clone();
        let firmware: Arc<dyn FirmwareProvider> = self.firmware.clone();
        Arc::new(Platform::new(
            hw,
            topology,
            scheduler,
            firmware,
            self.signature,
            config,
        ))
    }
}
