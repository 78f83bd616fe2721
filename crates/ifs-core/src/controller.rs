//! Per-test-type controller and the platform it runs on.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::cache::LoadCache;
use crate::config::IfsConfig;
use crate::error::IfsError;
use crate::executor::{CoreTestExecutor, CoreTestRun};
use crate::hw::{CoreTopology, CpuId, HardwareChannel, HwError, SiblingScheduler};
use crate::image::{CpuSignature, FirmwareProvider, ImageId};
use crate::isolation::{CoreClaims, SocketLocks};
use crate::loader::ImageLoader;
use crate::msr::{IntegrityCaps, TestKind, MSR_INTEGRITY_CAPS};
use crate::state::{LoadState, RunResult, TestStatus};

/// Collaborators and shared locks for every controller on one machine.
pub struct Platform {
    hw: Arc<dyn HardwareChannel>,
    topology: Arc<dyn CoreTopology>,
    scheduler: Arc<dyn SiblingScheduler>,
    firmware: Arc<dyn FirmwareProvider>,
    signature: CpuSignature,
    config: IfsConfig,
    claims: CoreClaims,
    socket_locks: SocketLocks,
}

impl Platform {
    /// Bundles the collaborators of one machine.
    #[must_use]
    pub fn new(
        hw: Arc<dyn HardwareChannel>,
        topology: Arc<dyn CoreTopology>,
        scheduler: Arc<dyn SiblingScheduler>,
        firmware: Arc<dyn FirmwareProvider>,
        signature: CpuSignature,
        config: IfsConfig,
    ) -> Self {
        Self {
            hw,
            topology,
            scheduler,
            firmware,
            signature,
            config,
            claims: CoreClaims::new(),
            socket_locks: SocketLocks::new(),
        }
    }

    /// Reads the integrity capabilities register on the first online CPU.
    ///
    /// # Errors
    ///
    /// Returns the [`HwError`] raised by the read.
    pub fn integrity_caps(&self) -> Result<IntegrityCaps, HwError> {
        let cpu = self.topology.online_cpus().first().copied().unwrap_or(0);
        self.hw.read(cpu, MSR_INTEGRITY_CAPS).map(IntegrityCaps)
    }

    /// Processor signature used to name images.
    #[must_use]
    pub const fn signature(&self) -> CpuSignature {
        self.signature
    }

    /// Shared configuration.
    #[must_use]
    pub const fn config(&self) -> &IfsConfig {
        &self.config
    }

    /// Topology collaborator.
    #[must_use]
    pub fn topology(&self) -> &dyn CoreTopology {
        self.topology.as_ref()
    }

    /// Registry of cores under test.
    #[must_use]
    pub const fn claims(&self) -> &CoreClaims {
        &self.claims
    }
}

/// Mutable bookkeeping only touched while the run lock is held.
#[derive(Debug, Default)]
struct Session {
    cache: LoadCache,
    pending: Option<u32>,
}

/// Controller for one test type.
///
/// Loads and runs are serialized by an internal run lock. Readers of the
/// load state and last result never wait for an in-flight run; they see
/// the previous values until it finishes.
pub struct TestController {
    platform: Arc<Platform>,
    kind: TestKind,
    session: Mutex<Session>,
    selected: RwLock<Option<u32>>,
    state: RwLock<LoadState>,
    result: RwLock<RunResult>,
}

impl TestController {
    /// Creates the controller for `kind` after checking hardware support.
    ///
    /// # Errors
    ///
    /// Returns [`IfsError::Unsupported`] when the capabilities register does
    /// not advertise `kind`, or [`IfsError::Hardware`] when it cannot be read.
    pub fn new(platform: Arc<Platform>, kind: TestKind) -> Result<Self, IfsError> {
        let caps = platform.integrity_caps()?;
        if !caps.supports(kind) {
            return Err(IfsError::Unsupported { kind });
        }
        debug!(
            %kind,
            generation = ?caps.generation(),
            array_generation = ?caps.array_generation(),
            "test controller ready"
        );
        Ok(Self {
            platform,
            kind,
            session: Mutex::new(Session::default()),
            selected: RwLock::new(None),
            state: RwLock::new(LoadState::new(caps.generation(), caps.array_generation())),
            result: RwLock::new(RunResult::default()),
        })
    }

    /// Test type driven by this controller.
    #[must_use]
    pub const fn kind(&self) -> TestKind {
        self.kind
    }

    /// Records the batch the next load attempt will use.
    ///
    /// With `eager_load` configured the batch is loaded immediately.
    ///
    /// # Errors
    ///
    /// Returns [`IfsError::NoImage`] for imageless tests,
    /// [`IfsError::InvalidBatch`] for batch 0, and with eager loading any
    /// provisioning, load or hardware error.
    pub fn select_batch(&self, batch: u32) -> Result<(), IfsError> {
        if !self.kind.uses_image() {
            return Err(IfsError::NoImage { kind: self.kind });
        }
        if batch == 0 {
            return Err(IfsError::InvalidBatch { batch });
        }
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.pending = Some(batch);
        *self.selected.write().unwrap_or_else(PoisonError::into_inner) = Some(batch);
        debug!(kind = %self.kind, batch, "batch selected");

        if self.platform.config.eager_load {
            self.ensure_loaded(&mut session)?;
        }
        Ok(())
    }

    /// Runs the test on the core containing `cpu` and records the result.
    ///
    /// # Errors
    ///
    /// Precondition errors ([`IfsError::UnknownCpu`],
    /// [`IfsError::SiblingOffline`], [`IfsError::NotLoaded`],
    /// [`IfsError::CoreBusy`]) are returned before any test round starts.
    /// Load and hardware errors are returned as they occur. None of these
    /// change the recorded result.
    pub fn run(&self, cpu: CpuId) -> Result<RunResult, IfsError> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let platform = self.platform.as_ref();

        let mut run = CoreTestRun::resolve(platform.topology(), cpu, 0)?;
        if self.kind.uses_image() {
            self.ensure_loaded(&mut session)?;
        }

        let state = self.load_state();
        run.stop_index = u16::try_from(state.num_chunks).unwrap_or(u16::MAX);
        let _claim = platform
            .claims
            .claim(run.core())
            .ok_or(IfsError::CoreBusy { cpu })?;

        let executor = CoreTestExecutor::new(
            platform.hw.as_ref(),
            platform.scheduler.as_ref(),
            &platform.config,
        );
        let result = executor.execute(self.kind, &run, &state)?;
        *self.result.write().unwrap_or_else(PoisonError::into_inner) = result;
        info!(
            kind = %self.kind,
            cpu,
            status = result.status.as_str(),
            details = format_args!("{:#x}", result.details),
            "test completed"
        );
        Ok(result)
    }

    /// Status of the most recent completed run.
    #[must_use]
    pub fn last_status(&self) -> TestStatus {
        self.last_result().status
    }

    /// Details word of the most recent completed run.
    #[must_use]
    pub fn last_details(&self) -> u64 {
        self.last_result().details
    }

    /// The most recent completed run.
    #[must_use]
    pub fn last_result(&self) -> RunResult {
        *self.result.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Revision of the loaded image, if one is loaded.
    #[must_use]
    pub fn loaded_version(&self) -> Option<u32> {
        let state = self.load_state();
        state.loaded.then_some(state.loaded_version).flatten()
    }

    /// Most recently selected batch.
    #[must_use]
    pub fn current_batch(&self) -> Option<u32> {
        *self.selected.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the load state.
    #[must_use]
    pub fn load_state(&self) -> LoadState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads a pending batch selection, or checks the resident image.
    ///
    /// The selection stays pending until an image was provisioned for it.
    fn ensure_loaded(&self, session: &mut Session) -> Result<(), IfsError> {
        match session.pending {
            Some(batch) => self.load_batch(session, batch),
            None if self.load_state().loaded => Ok(()),
            None => Err(IfsError::NotLoaded { kind: self.kind }),
        }
    }

    fn load_batch(&self, session: &mut Session, batch: u32) -> Result<(), IfsError> {
        let platform = self.platform.as_ref();
        let id = ImageId::new(platform.signature, batch);
        let current = self.load_state();
        if current.loaded && session.cache.is_current(&id) {
            debug!(kind = %self.kind, image = %id, "image already resident, skipping load");
            session.pending = None;
            return Ok(());
        }

        let image = platform.firmware.load_image(self.kind, &id)?;
        session.pending = None;
        let Some(loader) = ImageLoader::new(
            platform.hw.as_ref(),
            platform.topology.as_ref(),
            &platform.socket_locks,
            &platform.config,
            self.kind,
        ) else {
            return Err(IfsError::NoImage { kind: self.kind });
        };

        let report = loader.load(&image, &current);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = report.state;
        match report.result {
            Ok(()) => {
                session.cache.record(id, image.version());
                Ok(())
            }
            Err(error) => {
                session.cache.invalidate();
                Err(error)
            }
        }
    }
}
