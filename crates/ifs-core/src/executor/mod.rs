//! Running a loaded test on one physical core.
//!
//! Every protocol is a sequence of isolated rounds. A round pauses the
//! core's siblings, runs one thread per sibling that meets the others at a
//! rendezvous, issues the round's register writes, meets again and lets the
//! core's first thread read back the status word. The protocol modules decide
//! what to write and how to interpret the answer; [`Supervisor`] applies the
//! shared restart budget and wall-clock bound.

/// Array-BIST protocols.
pub mod array;
/// SBAF bundle walk.
pub mod sbaf;
/// Scan (SAF) chunk activation.
pub mod scan;

use std::panic;
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::IfsConfig;
use crate::error::IfsError;
use crate::fault::SoftwareCode;
use crate::hw::{CoreTopology, CpuId, HardwareChannel, HwError, SiblingScheduler};
use crate::isolation::{Isolation, Rendezvous};
use crate::msr::{ArrayGeneration, TestKind};
use crate::state::{LoadState, RunResult};

/// One run request resolved against the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreTestRun {
    /// Requested logical CPU.
    pub cpu: CpuId,
    /// Every logical CPU of the physical core, ascending.
    pub siblings: Vec<CpuId>,
    /// First chunk to execute.
    pub start_index: u16,
    /// Chunk index the run stops at.
    pub stop_index: u16,
}

impl CoreTestRun {
    /// Resolves `cpu` to its sibling set and checks every sibling is online.
    ///
    /// # Errors
    ///
    /// Returns [`IfsError::UnknownCpu`] when the topology does not know `cpu`
    /// and [`IfsError::SiblingOffline`] when any sibling is offline.
    pub fn resolve(
        topology: &dyn CoreTopology,
        cpu: CpuId,
        stop_index: u16,
    ) -> Result<Self, IfsError> {
        let mut siblings = topology.siblings_of(cpu);
        if siblings.is_empty() {
            return Err(IfsError::UnknownCpu { cpu });
        }
        siblings.sort_unstable();
        siblings.dedup();
        if let Some(&sibling) = siblings.iter().find(|&&s| !topology.is_online(s)) {
            return Err(IfsError::SiblingOffline { cpu, sibling });
        }
        Ok(Self {
            cpu,
            siblings,
            start_index: 0,
            stop_index,
        })
    }

    /// Identifier of the physical core: its lowest-numbered sibling.
    #[must_use]
    pub fn core(&self) -> CpuId {
        self.siblings.first().copied().unwrap_or(self.cpu)
    }
}

/// Tracks forward progress and elapsed time across rounds.
#[derive(Debug)]
pub(crate) struct Supervisor {
    deadline: Instant,
    max_restarts: u32,
    stalls: u32,
}

impl Supervisor {
    pub(crate) fn new(config: &IfsConfig) -> Self {
        Self {
            deadline: Instant::now() + config.run_timeout,
            max_restarts: config.max_restarts,
            stalls: 0,
        }
    }

    /// Accounts for a non-terminal round. Returns the code to report when
    /// the run must stop.
    pub(crate) fn after_round(&mut self, progressed: bool) -> Option<SoftwareCode> {
        if progressed {
            self.stalls = 0;
        } else {
            self.stalls += 1;
        }
        if Instant::now() >= self.deadline {
            warn!("test did not finish within the run timeout");
            return Some(SoftwareCode::Timeout);
        }
        if self.stalls > self.max_restarts {
            warn!(stalls = self.stalls, "test made no progress, giving up");
            return Some(SoftwareCode::PartialCompletion);
        }
        None
    }
}

/// Drives test protocols on isolated cores.
pub struct CoreTestExecutor<'a> {
    hw: &'a dyn HardwareChannel,
    scheduler: &'a dyn SiblingScheduler,
    config: &'a IfsConfig,
}

impl<'a> CoreTestExecutor<'a> {
    /// Builds an executor over the platform collaborators.
    #[must_use]
    pub fn new(
        hw: &'a dyn HardwareChannel,
        scheduler: &'a dyn SiblingScheduler,
        config: &'a IfsConfig,
    ) -> Self {
        Self {
            hw,
            scheduler,
            config,
        }
    }

    /// Runs `kind` on `run`'s core and returns the verdict.
    ///
    /// # Errors
    ///
    /// Returns [`IfsError::Hardware`] when a register access faults. The
    /// siblings are resumed before the error is returned.
    pub fn execute(
        &self,
        kind: TestKind,
        run: &CoreTestRun,
        state: &LoadState,
    ) -> Result<RunResult, IfsError> {
        debug!(%kind, cpu = run.cpu, siblings = ?run.siblings, "starting test run");
        let result = match kind {
            TestKind::Saf => self.run_scan(run, state),
            TestKind::ArrayBist => match state.array_generation {
                ArrayGeneration::Gen0 => self.run_array_gen0(run),
                ArrayGeneration::Gen1 => self.run_array_gen1(run),
            },
            TestKind::Sbaf => self.run_sbaf(run, state),
        }?;
        debug!(
            %kind,
            cpu = run.cpu,
            status = result.status.as_str(),
            details = format_args!("{:#x}", result.details),
            "test run finished"
        );
        Ok(result)
    }

    /// One isolated round on `siblings`.
    ///
    /// Each sibling thread calls `write` with its own CPU between the two
    /// rendezvous points; the first sibling then calls `read`. Returns
    /// `None` when the siblings could not be gathered.
    pub(crate) fn isolated_round<W, R>(
        &self,
        siblings: &[CpuId],
        write: W,
        read: R,
    ) -> Result<Option<u64>, IfsError>
    where
        W: Fn(CpuId) -> Result<(), HwError> + Sync,
        R: Fn(CpuId) -> Result<u64, HwError> + Sync,
    {
        let Some(&primary) = siblings.first() else {
            return Ok(None);
        };
        let _isolated = Isolation::enter(self.scheduler, siblings);
        let timeout = self.config.rendezvous_timeout;
        let gathered = Rendezvous::new(siblings.len());
        let written = Rendezvous::new(siblings.len());

        thread::scope(|scope| {
            let handles: Vec<_> = siblings
                .iter()
                .map(|&cpu| {
                    let (gathered, written, write, read) = (&gathered, &written, &write, &read);
                    scope.spawn(move || -> Result<Option<u64>, HwError> {
                        if !gathered.wait(timeout) {
                            return Ok(None);
                        }
                        if let Err(error) = write(cpu) {
                            written.abandon();
                            return Err(error);
                        }
                        if !written.wait(timeout) {
                            return Ok(None);
                        }
                        if cpu == primary {
                            read(cpu).map(Some)
                        } else {
                            Ok(None)
                        }
                    })
                })
                .collect();

            let mut status = None;
            let mut failure = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(Some(word))) => status = Some(word),
                    Ok(Ok(None)) => {}
                    Ok(Err(error)) => {
                        failure.get_or_insert(error);
                    }
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            if let Some(error) = failure {
                return Err(IfsError::Hardware(error));
            }
            if status.is_none() {
                debug!(?siblings, "siblings did not meet at the rendezvous");
            }
            Ok(status)
        })
    }
}
