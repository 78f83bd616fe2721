//! Register-level model of the test hardware.
//!
//! Image blocks are tracked per (socket, test type); run state per physical
//! core. Activation registers fire once every online sibling of the core has
//! written them, mirroring the hardware's all-threads requirement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::firmware::{digest, HashBlob, SimMemory};
use super::topology::SimTopology;
use crate::fault::{AuthErrorCode, HashErrorCode, ScanErrorCode};
use crate::hw::{CoreTopology, CpuId, HardwareChannel, HwError, SocketId};
use crate::image::CpuSignature;
use crate::layout::array::{ArrayCommand, ARRAY_GEN1_STATUS_FAIL, ARRAY_GEN1_TEST_ALL_ARRAYS};
use crate::layout::sbaf::{SbafActivate, SbafOutcome, SbafStatus, SBAF_PROGRAMS_PER_BUNDLE};
use crate::layout::{ChunkAuthStatus, HashStatus, RegisterLayout, RunStatus};
use crate::msr::{
    ArrayGeneration, Generation, IntegrityCaps, TestKind, INVALIDATE_STRIDE, MSR_ARRAY_BIST,
    MSR_ARRAY_STATUS, MSR_ARRAY_TRIGGER, MSR_INTEGRITY_CAPS,
};

/// Arrays cleared from the bitmask by one gen0 Array-BIST write.
const ARRAYS_PER_ROUND: u32 = 8;

/// Chunk authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthFault {
    /// Chunk index that fails.
    pub chunk: u32,
    /// Error code reported.
    pub code: u8,
    /// Attempts that fail before the chunk authenticates.
    pub times: u32,
}

/// Interruption of a scan at a given chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanInterrupt {
    /// Chunk the run stops at.
    pub at: u16,
    /// Activations that are interrupted.
    pub times: u32,
}

/// Interruption of an SBAF bundle at a given program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbafInterrupt {
    /// Bundle index.
    pub bundle: u16,
    /// Program the run stops at.
    pub program: u8,
    /// Activations that are interrupted.
    pub times: u32,
}

/// Injected misbehaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Error code reported by every hash copy.
    pub hash_error: Option<u8>,
    /// Chunk authentication failure.
    pub auth_error: Option<AuthFault>,
    /// Scan interruption.
    pub scan_interrupt: Option<ScanInterrupt>,
    /// Chunk producing a signature error.
    pub signature_chunk: Option<u16>,
    /// Error code for activations that never start.
    pub not_started: Option<u8>,
    /// Array-BIST finds a failing array.
    pub array_fail: bool,
    /// Array-BIST gen0 makes no progress.
    pub array_stall: bool,
    /// SBAF (bundle, program) producing a signature failure.
    pub sbaf_signature: Option<(u16, u8)>,
    /// SBAF interruption.
    pub sbaf_interrupt: Option<SbafInterrupt>,
    /// Register whose every access faults.
    pub register_fault: Option<u32>,
    /// Stride invalidation is ignored.
    pub stuck_stride: bool,
}

#[derive(Debug, Clone)]
struct ImageBlock {
    hash_status: u64,
    blob: Option<HashBlob>,
    data_base: u64,
    authentic: Vec<bool>,
    valid: u32,
    stale: bool,
    last_error: u8,
}

impl ImageBlock {
    const fn new() -> Self {
        Self {
            hash_status: 0,
            blob: None,
            data_base: 0,
            authentic: Vec::new(),
            valid: 0,
            stale: false,
            last_error: 0,
        }
    }

    fn fully_loaded(&self) -> bool {
        !self.stale && !self.authentic.is_empty() && self.authentic.iter().all(|&ok| ok)
    }
}

#[derive(Debug, Default)]
struct CoreRegs {
    pending: HashMap<u32, Vec<(CpuId, u64)>>,
    scan_status: u64,
    sbaf_status: u64,
    array_word: u64,
    array_status: u64,
}

#[derive(Debug, Default)]
struct SimState {
    faults: SimFaults,
    blocks: HashMap<(SocketId, TestKind), ImageBlock>,
    cores: HashMap<CpuId, CoreRegs>,
    writes: Vec<(CpuId, u32, u64)>,
    reads: usize,
}

/// Simulated register file shared by every logical CPU.
#[derive(Debug)]
pub struct SimHardware {
    signature: CpuSignature,
    generation: Generation,
    caps: IntegrityCaps,
    topology: Arc<SimTopology>,
    memory: Arc<SimMemory>,
    state: Mutex<SimState>,
}

impl SimHardware {
    /// Hardware for a processor with `signature` advertising `kinds`.
    #[must_use]
    pub fn new(
        signature: CpuSignature,
        kinds: &[TestKind],
        generation: Generation,
        array_generation: ArrayGeneration,
        topology: Arc<SimTopology>,
        memory: Arc<SimMemory>,
    ) -> Self {
        Self {
            signature,
            generation,
            caps: IntegrityCaps::compose(kinds, generation, array_generation),
            topology,
            memory,
            state: Mutex::new(SimState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Edits the injected faults.
    pub fn update_faults(&self, edit: impl FnOnce(&mut SimFaults)) {
        edit(&mut self.lock().faults);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults = SimFaults::default();
    }

    /// Copy of the injected faults.
    #[must_use]
    pub fn faults(&self) -> SimFaults {
        self.lock().faults.clone()
    }

    /// Total register reads and writes so far.
    #[must_use]
    pub fn access_count(&self) -> usize {
        let state = self.lock();
        state.reads + state.writes.len()
    }

    /// Writes issued to `reg` so far.
    #[must_use]
    pub fn writes_to(&self, reg: u32) -> usize {
        self.lock().writes.iter().filter(|(_, r, _)| *r == reg).count()
    }

    /// Chunks currently authenticated for `kind` on `socket`.
    #[must_use]
    pub fn resident_chunks(&self, socket: SocketId, kind: TestKind) -> u32 {
        self.lock()
            .blocks
            .get(&(socket, kind))
            .map_or(0, |block| block.valid)
    }

    fn layout(&self) -> RegisterLayout {
        RegisterLayout::for_generation(self.generation)
    }

    fn socket(&self, cpu: CpuId, reg: u32, value: Option<u64>) -> Result<SocketId, HwError> {
        self.topology.socket_of(cpu).ok_or(match value {
            Some(value) => HwError::WriteFault { cpu, reg, value },
            None => HwError::ReadFault { cpu, reg },
        })
    }

    fn copy_hashes(&self, state: &mut SimState, socket: SocketId, kind: TestKind, address: u64) {
        let gen2 = self.generation == Generation::Gen2;
        let hash_error = state.faults.hash_error;
        let block = state
            .blocks
            .entry((socket, kind))
            .or_insert_with(ImageBlock::new);
        let parsed = self.memory.region(address).and_then(|bytes| HashBlob::parse(&bytes));

        let reject = |code: u8| {
            RegisterLayout::for_generation(self.generation).encode_hash_status(HashStatus {
                error_code: code,
                ..HashStatus::default()
            })
        };
        let blob = match (hash_error, parsed) {
            (Some(code), _) => {
                block.hash_status = reject(code);
                return;
            }
            (None, None) => {
                block.hash_status = reject(HashErrorCode::SecureMemoryNotSetUp.as_u8());
                return;
            }
            (None, Some(blob)) if blob.signature != self.signature => {
                block.hash_status = reject(HashErrorCode::ProgramIdMismatch.as_u8());
                return;
            }
            (None, Some(blob)) => blob,
        };

        let count = blob.digests.len();
        let size = u64::from(blob.chunk_size.max(1));
        let blob_len = (16 + 8 * count) as u64;
        block.data_base = address + blob_len.div_ceil(size).max(1) * size;
        block.hash_status = self.layout().encode_hash_status(HashStatus {
            chunk_size: u16::try_from(blob.chunk_size).unwrap_or(u16::MAX),
            num_chunks: u16::try_from(count).unwrap_or(u16::MAX),
            error_code: 0,
            chunks_in_stride: u16::try_from(count.min(0x1FF)).unwrap_or(0x1FF),
            max_core_limit: u16::try_from(self.topology.cpu_count()).unwrap_or(0xFFF),
            valid: true,
        });
        block.authentic = vec![false; count];
        block.last_error = 0;
        if gen2 {
            block.stale = block.valid > 0;
        } else {
            block.valid = 0;
            block.stale = false;
        }
        block.blob = Some(blob);
    }

    fn copy_chunk(&self, state: &mut SimState, socket: SocketId, kind: TestKind, address: u64) {
        let mut auth_fault = state.faults.auth_error;
        let block = state
            .blocks
            .entry((socket, kind))
            .or_insert_with(ImageBlock::new);
        let code = Self::authenticate(&self.memory, block, address, &mut auth_fault);
        block.last_error = code;
        if code == 0 {
            block.valid += 1;
        }
        state.faults.auth_error = auth_fault;
    }

    fn authenticate(
        memory: &SimMemory,
        block: &mut ImageBlock,
        address: u64,
        auth_fault: &mut Option<AuthFault>,
    ) -> u8 {
        let Some(blob) = &block.blob else {
            return AuthErrorCode::HashMismatch.as_u8();
        };
        if block.stale {
            return AuthErrorCode::OutsideStride.as_u8();
        }
        let size = u64::from(blob.chunk_size.max(1));
        let Some(offset) = address.checked_sub(block.data_base) else {
            return AuthErrorCode::OutsideStride.as_u8();
        };
        let Ok(index) = usize::try_from(offset / size) else {
            return AuthErrorCode::OutsideStride.as_u8();
        };
        if index >= blob.digests.len() {
            return AuthErrorCode::OutsideStride.as_u8();
        }
        if let Some(fault) = auth_fault.as_mut() {
            if usize::try_from(fault.chunk).ok() == Some(index) && fault.times > 0 {
                fault.times -= 1;
                return fault.code;
            }
        }
        if block.authentic[index] {
            return AuthErrorCode::AlreadyAuthentic.as_u8();
        }
        let matches = memory
            .region(address)
            .is_some_and(|bytes| digest(&bytes) == blob.digests[index]);
        if !matches {
            return AuthErrorCode::HashMismatch.as_u8();
        }
        block.authentic[index] = true;
        0
    }

    fn chunk_status(&self, state: &SimState, socket: SocketId, kind: TestKind) -> u64 {
        let Some(block) = state.blocks.get(&(socket, kind)) else {
            return 0;
        };
        let (total, max_bundle) = block
            .blob
            .as_ref()
            .map_or((0, 0), |blob| (blob.digests.len(), blob.max_bundle));
        self.layout().encode_chunk_auth(ChunkAuthStatus {
            valid_chunks: u16::try_from(block.valid).unwrap_or(u16::MAX),
            total_chunks: u16::try_from(total).unwrap_or(u16::MAX),
            error_code: block.last_error,
            max_bundle,
        })
    }

    fn invalidate(state: &mut SimState, socket: SocketId, kind: TestKind) {
        if state.faults.stuck_stride {
            return;
        }
        if let Some(block) = state.blocks.get_mut(&(socket, kind)) {
            block.valid = 0;
            block.stale = false;
            block.authentic.iter_mut().for_each(|ok| *ok = false);
        }
    }

    /// Records an activation write; returns the agreed value once every
    /// online sibling has written, or `None` while waiting.
    fn gather(&self, state: &mut SimState, cpu: CpuId, reg: u32, value: u64) -> Option<Result<u64, ()>> {
        let core = self.topology.core_of(cpu);
        let expected = self
            .topology
            .siblings_of(cpu)
            .into_iter()
            .filter(|&s| self.topology.is_online(s))
            .count();
        let regs = state.cores.entry(core).or_default();
        let pending = regs.pending.entry(reg).or_default();
        pending.retain(|(writer, _)| *writer != cpu);
        pending.push((cpu, value));
        if pending.len() < expected {
            return None;
        }
        let writes = std::mem::take(pending);
        let agreed = writes.iter().all(|(_, v)| *v == value);
        Some(if agreed { Ok(value) } else { Err(()) })
    }

    fn run_scan(&self, state: &mut SimState, cpu: CpuId, socket: SocketId, word: Result<u64, ()>) {
        let layout = self.layout();
        let loaded = state
            .blocks
            .get(&(socket, TestKind::Saf))
            .filter(|block| block.fully_loaded())
            .and_then(|block| block.blob.as_ref())
            .map(|blob| blob.digests.len());
        let status = match word {
            Err(()) => RunStatus {
                error_code: ScanErrorCode::MismatchArgumentsBetweenThreads.as_u8(),
                ..RunStatus::default()
            },
            Ok(word) => {
                let command = layout.decode_activate(word);
                let base = RunStatus {
                    chunk_num: command.start,
                    chunk_stop_index: command.stop,
                    ..RunStatus::default()
                };
                let faults = &mut state.faults;
                match loaded {
                    None => RunStatus {
                        error_code: ScanErrorCode::CoreNotCapableCurrently.as_u8(),
                        ..base
                    },
                    Some(count)
                        if command.start >= command.stop || usize::from(command.stop) > count =>
                    {
                        RunStatus {
                            error_code: ScanErrorCode::InvalidChunkRange.as_u8(),
                            ..base
                        }
                    }
                    Some(_) => {
                        let window = command.start..command.stop;
                        if let Some(code) = faults.not_started {
                            RunStatus {
                                error_code: code,
                                ..base
                            }
                        } else if let Some(interrupt) = faults
                            .scan_interrupt
                            .as_mut()
                            .filter(|i| i.times > 0 && window.contains(&i.at))
                        {
                            interrupt.times -= 1;
                            RunStatus {
                                chunk_num: interrupt.at,
                                error_code: ScanErrorCode::InterruptedDuringExecution.as_u8(),
                                ..base
                            }
                        } else if let Some(chunk) =
                            faults.signature_chunk.filter(|c| window.contains(c))
                        {
                            RunStatus {
                                chunk_num: chunk,
                                signature_error: true,
                                ..base
                            }
                        } else {
                            RunStatus {
                                chunk_num: command.stop - 1,
                                ..base
                            }
                        }
                    }
                }
            }
        };
        trace!(cpu, ?status, "simulated scan finished");
        let encoded = layout.encode_run_status(status);
        state
            .cores
            .entry(self.topology.core_of(cpu))
            .or_default()
            .scan_status = encoded;
    }

    fn run_sbaf(&self, state: &mut SimState, cpu: CpuId, socket: SocketId, word: Result<u64, ()>) {
        let max_bundle = state
            .blocks
            .get(&(socket, TestKind::Sbaf))
            .filter(|block| block.fully_loaded())
            .and_then(|block| block.blob.as_ref())
            .map(|blob| blob.max_bundle);
        let status = match word {
            Err(()) => SbafStatus {
                bundle_idx: 0,
                pgm_idx: 0,
                error_code: ScanErrorCode::MismatchArgumentsBetweenThreads.as_u8(),
                test_fail: false,
                outcome: SbafOutcome::Pass,
            },
            Ok(word) => {
                let command = SbafActivate::decode(word);
                let base = SbafStatus {
                    bundle_idx: command.bundle_idx,
                    pgm_idx: command.pgm_idx,
                    error_code: 0,
                    test_fail: false,
                    outcome: SbafOutcome::Pass,
                };
                let faults = &mut state.faults;
                match max_bundle {
                    None => SbafStatus {
                        error_code: ScanErrorCode::CoreNotCapableCurrently.as_u8(),
                        ..base
                    },
                    Some(max) if command.bundle_idx > max => SbafStatus {
                        error_code: ScanErrorCode::InvalidChunkRange.as_u8(),
                        ..base
                    },
                    Some(_) => {
                        let here = |bundle: u16, program: u8| {
                            bundle == command.bundle_idx && program >= command.pgm_idx
                        };
                        if let Some(code) = faults.not_started {
                            SbafStatus {
                                error_code: code,
                                ..base
                            }
                        } else if let Some((_, program)) =
                            faults.sbaf_signature.filter(|&(b, p)| here(b, p))
                        {
                            SbafStatus {
                                pgm_idx: program,
                                outcome: SbafOutcome::SignatureFail,
                                ..base
                            }
                        } else if let Some(interrupt) = faults
                            .sbaf_interrupt
                            .as_mut()
                            .filter(|i| i.times > 0 && here(i.bundle, i.program))
                        {
                            interrupt.times -= 1;
                            SbafStatus {
                                pgm_idx: interrupt.program,
                                error_code: ScanErrorCode::InterruptedDuringExecution.as_u8(),
                                outcome: SbafOutcome::Interrupted,
                                ..base
                            }
                        } else {
                            SbafStatus {
                                pgm_idx: SBAF_PROGRAMS_PER_BUNDLE - 1,
                                ..base
                            }
                        }
                    }
                }
            }
        };
        trace!(cpu, ?status, "simulated sbaf bundle finished");
        state
            .cores
            .entry(self.topology.core_of(cpu))
            .or_default()
            .sbaf_status = status.encode();
    }

    fn run_array_gen0(state: &mut SimState, core: CpuId, word: u64) {
        let command = ArrayCommand::decode(word);
        let faults = &state.faults;
        let reply = if faults.array_stall {
            command
        } else if faults.array_fail && command.array_bitmask != 0 {
            ArrayCommand {
                ctrl_result: true,
                ..command
            }
        } else {
            let mut remaining = command.array_bitmask;
            for _ in 0..ARRAYS_PER_ROUND {
                remaining &= remaining.wrapping_sub(1);
            }
            ArrayCommand {
                array_bitmask: remaining,
                array_bank: 0,
                ctrl_result: false,
            }
        };
        state.cores.entry(core).or_default().array_word = reply.encode();
    }

    fn run_array_gen1(state: &mut SimState, core: CpuId, word: u64) {
        let status = if word & ARRAY_GEN1_TEST_ALL_ARRAYS != 0 && state.faults.array_fail {
            ARRAY_GEN1_STATUS_FAIL
        } else {
            0
        };
        state.cores.entry(core).or_default().array_status = status;
    }

    fn kind_for(reg: u32) -> Option<(TestKind, u32)> {
        [TestKind::Saf, TestKind::Sbaf].into_iter().find_map(|kind| {
            let msrs = kind.msrs()?;
            [
                msrs.copy_hashes,
                msrs.copy_hashes_status,
                msrs.copy_chunks,
                msrs.copy_chunks_status,
                msrs.activate,
                msrs.status,
                msrs.test_ctrl,
            ]
            .contains(&reg)
            .then_some((kind, reg))
        })
    }
}

impl HardwareChannel for SimHardware {
    fn read(&self, cpu: CpuId, reg: u32) -> Result<u64, HwError> {
        let fault = HwError::ReadFault { cpu, reg };
        let mut state = self.lock();
        state.reads += 1;
        if state.faults.register_fault == Some(reg) || !self.topology.is_online(cpu) {
            return Err(fault);
        }
        if reg == MSR_INTEGRITY_CAPS {
            return Ok(self.caps.0);
        }
        let core = self.topology.core_of(cpu);
        if reg == MSR_ARRAY_BIST {
            return Ok(state.cores.get(&core).map_or(0, |regs| regs.array_word));
        }
        if reg == MSR_ARRAY_STATUS {
            return Ok(state.cores.get(&core).map_or(0, |regs| regs.array_status));
        }
        let (kind, reg) = Self::kind_for(reg).ok_or(fault)?;
        let msrs = kind.msrs().ok_or(fault)?;
        let socket = self.socket(cpu, reg, None)?;
        if reg == msrs.copy_hashes_status {
            Ok(state
                .blocks
                .get(&(socket, kind))
                .map_or(0, |block| block.hash_status))
        } else if reg == msrs.copy_chunks_status {
            Ok(self.chunk_status(&state, socket, kind))
        } else if reg == msrs.status {
            let regs = state.cores.get(&core);
            Ok(match kind {
                TestKind::Sbaf => regs.map_or(0, |r| r.sbaf_status),
                _ => regs.map_or(0, |r| r.scan_status),
            })
        } else {
            Err(fault)
        }
    }

    fn write(&self, cpu: CpuId, reg: u32, value: u64) -> Result<(), HwError> {
        let fault = HwError::WriteFault { cpu, reg, value };
        let mut state = self.lock();
        state.writes.push((cpu, reg, value));
        if state.faults.register_fault == Some(reg) || !self.topology.is_online(cpu) {
            return Err(fault);
        }
        let core = self.topology.core_of(cpu);
        if reg == MSR_ARRAY_BIST {
            Self::run_array_gen0(&mut state, core, value);
            return Ok(());
        }
        if reg == MSR_ARRAY_TRIGGER {
            Self::run_array_gen1(&mut state, core, value);
            return Ok(());
        }
        let (kind, reg) = Self::kind_for(reg).ok_or(fault)?;
        let msrs = kind.msrs().ok_or(fault)?;
        let socket = self.socket(cpu, reg, Some(value))?;
        if reg == msrs.copy_hashes {
            self.copy_hashes(&mut state, socket, kind, value);
        } else if reg == msrs.copy_chunks {
            self.copy_chunk(&mut state, socket, kind, value);
        } else if reg == msrs.test_ctrl {
            if value & INVALIDATE_STRIDE != 0 {
                Self::invalidate(&mut state, socket, kind);
            }
        } else if reg == msrs.activate {
            if let Some(agreed) = self.gather(&mut state, cpu, reg, value) {
                match kind {
                    TestKind::Sbaf => self.run_sbaf(&mut state, cpu, socket, agreed),
                    _ => self.run_scan(&mut state, cpu, socket, agreed),
                }
            }
        } else {
            return Err(fault);
        }
        Ok(())
    }
}
