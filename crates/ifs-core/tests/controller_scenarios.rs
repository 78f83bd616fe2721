//! Controller behaviour against scripted register responses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ifs_core::msr::{
    MSR_ACTIVATE_SCAN, MSR_AUTHENTICATE_AND_COPY_CHUNK, MSR_CHUNKS_AUTHENTICATION_STATUS,
    MSR_COPY_SCAN_HASHES, MSR_INTEGRITY_CAPS, MSR_SCAN_HASHES_STATUS, MSR_SCAN_STATUS,
};
use ifs_core::{
    ArrayGeneration, ChunkAuthStatus, CoreTopology, CpuId, CpuSignature, ErrorClass,
    FirmwareProvider, Generation, HardwareChannel, HashStatus, HwError, IfsConfig, IfsError,
    ImageId, IntegrityCaps, Platform, ProvisionError, RegisterLayout, RunResult, RunStatus,
    SiblingScheduler, SocketId, TestController, TestImage, TestKind, TestStatus,
};
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

const SIGNATURE: CpuSignature = CpuSignature::new(0x06, 0x8f, 0x06);
const LAYOUT: RegisterLayout = RegisterLayout::Gen0;

/// Register file answering reads from per-register queues.
///
/// When a queue is empty the register's sticky value is returned; registers
/// with neither fault.
#[derive(Default)]
struct ScriptedHw {
    queued: Mutex<HashMap<u32, VecDeque<u64>>>,
    sticky: Mutex<HashMap<u32, u64>>,
    faulting: Mutex<HashSet<u32>>,
    writes: Mutex<Vec<(CpuId, u32, u64)>>,
    accesses: AtomicUsize,
}

impl ScriptedHw {
    fn new(caps: IntegrityCaps) -> Self {
        let hw = Self::default();
        hw.stick(MSR_INTEGRITY_CAPS, caps.0);
        hw
    }

    fn queue(&self, reg: u32, words: impl IntoIterator<Item = u64>) {
        self.queued
            .lock()
            .expect("queue")
            .entry(reg)
            .or_default()
            .extend(words);
    }

    fn stick(&self, reg: u32, word: u64) {
        self.sticky.lock().expect("sticky").insert(reg, word);
    }

    fn fault(&self, reg: u32) {
        self.faulting.lock().expect("faulting").insert(reg);
    }

    fn writes_to(&self, reg: u32) -> Vec<(CpuId, u64)> {
        self.writes
            .lock()
            .expect("writes")
            .iter()
            .filter(|(_, r, _)| *r == reg)
            .map(|(cpu, _, value)| (*cpu, *value))
            .collect()
    }

    fn accesses(&self) -> usize {
        self.accesses.load(Ordering::SeqCst)
    }

    /// Scripts a clean load of a four-chunk image.
    fn script_clean_load(&self) {
        self.queue(MSR_SCAN_HASHES_STATUS, [hash_status(4)]);
        self.queue(
            MSR_CHUNKS_AUTHENTICATION_STATUS,
            (1..=4).map(|valid| chunk_status(valid, 0)),
        );
    }
}

impl HardwareChannel for ScriptedHw {
    fn read(&self, cpu: CpuId, reg: u32) -> Result<u64, HwError> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        if self.faulting.lock().expect("faulting").contains(&reg) {
            return Err(HwError::ReadFault { cpu, reg });
        }
        if let Some(word) = self
            .queued
            .lock()
            .expect("queue")
            .get_mut(&reg)
            .and_then(VecDeque::pop_front)
        {
            return Ok(word);
        }
        self.sticky
            .lock()
            .expect("sticky")
            .get(&reg)
            .copied()
            .ok_or(HwError::ReadFault { cpu, reg })
    }

    fn write(&self, cpu: CpuId, reg: u32, value: u64) -> Result<(), HwError> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        self.writes.lock().expect("writes").push((cpu, reg, value));
        Ok(())
    }
}

/// Two sockets of two-thread cores, CPUs 0..8.
#[derive(Default)]
struct PairTopology {
    offline: Mutex<HashSet<CpuId>>,
}

impl CoreTopology for PairTopology {
    fn siblings_of(&self, cpu: CpuId) -> Vec<CpuId> {
        if cpu < 8 {
            vec![cpu & !1, cpu | 1]
        } else {
            Vec::new()
        }
    }

    fn is_online(&self, cpu: CpuId) -> bool {
        !self.offline.lock().expect("offline").contains(&cpu)
    }

    fn socket_of(&self, cpu: CpuId) -> Option<SocketId> {
        (cpu < 8).then_some(0)
    }

    fn online_cpus(&self) -> Vec<CpuId> {
        (0..8).filter(|&cpu| self.is_online(cpu)).collect()
    }
}

#[derive(Default)]
struct CountingScheduler {
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl SiblingScheduler for CountingScheduler {
    fn pause(&self, _cpus: &[CpuId]) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self, _cpus: &[CpuId]) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Provides a 4 x 64 byte image for batch 1.
#[derive(Default)]
struct OneImage {
    requests: AtomicUsize,
}

impl FirmwareProvider for OneImage {
    fn load_image(&self, kind: TestKind, id: &ImageId) -> Result<TestImage, ProvisionError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if id.batch != 1 {
            return Err(ProvisionError::NotFound { kind, id: *id });
        }
        TestImage::new(*id, 0x12, 64, vec![0x5A; 16], vec![vec![0xC3; 64]; 4], 0x10_0000)
    }
}

struct Rig {
    hw: Arc<ScriptedHw>,
    topology: Arc<PairTopology>,
    scheduler: Arc<CountingScheduler>,
    firmware: Arc<OneImage>,
    platform: Arc<Platform>,
}

impl Rig {
    fn new(config: IfsConfig) -> Self {
        Self::with_caps(
            config,
            IntegrityCaps::compose(
                &[TestKind::Saf, TestKind::ArrayBist],
                Generation::Gen0,
                ArrayGeneration::Gen0,
            ),
        )
    }

    fn with_caps(config: IfsConfig, caps: IntegrityCaps) -> Self {
        let hw = Arc::new(ScriptedHw::new(caps));
        let topology = Arc::new(PairTopology::default());
        let scheduler = Arc::new(CountingScheduler::default());
        let firmware = Arc::new(OneImage::default());
        let platform = Arc::new(Platform::new(
            Arc::clone(&hw) as Arc<dyn HardwareChannel>,
            Arc::clone(&topology) as Arc<dyn CoreTopology>,
            Arc::clone(&scheduler) as Arc<dyn SiblingScheduler>,
            Arc::clone(&firmware) as Arc<dyn FirmwareProvider>,
            SIGNATURE,
            config,
        ));
        Self {
            hw,
            topology,
            scheduler,
            firmware,
            platform,
        }
    }

    fn saf(&self) -> TestController {
        TestController::new(Arc::clone(&self.platform), TestKind::Saf).expect("saf supported")
    }

    fn isolations(&self) -> (usize, usize) {
        (
            self.scheduler.pauses.load(Ordering::SeqCst),
            self.scheduler.resumes.load(Ordering::SeqCst),
        )
    }
}

fn hash_status(chunks: u16) -> u64 {
    LAYOUT.encode_hash_status(HashStatus {
        chunk_size: 64,
        num_chunks: chunks,
        error_code: 0,
        chunks_in_stride: 0,
        max_core_limit: 1,
        valid: true,
    })
}

fn chunk_status(valid: u16, error_code: u8) -> u64 {
    LAYOUT.encode_chunk_auth(ChunkAuthStatus {
        valid_chunks: valid,
        total_chunks: 4,
        error_code,
        max_bundle: 0,
    })
}

fn run_status(chunk_num: u16, error_code: u8) -> u64 {
    LAYOUT.encode_run_status(RunStatus {
        chunk_num,
        chunk_stop_index: 4,
        error_code,
        control_error: false,
        signature_error: false,
    })
}

#[test]
fn clean_load_and_run_passes_with_zero_details() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    rig.hw.stick(MSR_SCAN_STATUS, 0);
    let saf = rig.saf();

    assert_eq!(saf.last_status(), TestStatus::NotTested);
    saf.select_batch(1).expect("batch 1");
    let result = saf.run(0).expect("run");

    assert_eq!(result, RunResult::pass(0));
    assert_eq!(saf.last_status(), TestStatus::Pass);
    assert_eq!(saf.last_details(), 0);
    let state = saf.load_state();
    assert!(state.loaded);
    assert!(!state.loading_error);
    assert_eq!(state.valid_chunks, 4);
    assert_eq!(saf.loaded_version(), Some(0x12));
    assert_eq!(saf.current_batch(), Some(1));
    assert_eq!(rig.isolations(), (1, 1));

    let activations = rig.hw.writes_to(MSR_ACTIVATE_SCAN);
    let cpus: HashSet<CpuId> = activations.iter().map(|(cpu, _)| *cpu).collect();
    assert_eq!(cpus, HashSet::from([0, 1]));
    let command = LAYOUT.decode_activate(activations[0].1);
    assert_eq!((command.start, command.stop), (0, 4));
    assert_eq!(command.delay, 100_000);
}

#[test]
fn reselecting_the_resident_image_does_not_transfer_again() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    rig.hw.stick(MSR_SCAN_STATUS, 0);
    let saf = rig.saf();

    saf.select_batch(1).expect("batch 1");
    saf.run(0).expect("first run");
    let hash_copies = rig.hw.writes_to(MSR_COPY_SCAN_HASHES).len();
    let chunk_copies = rig.hw.writes_to(MSR_AUTHENTICATE_AND_COPY_CHUNK).len();
    assert_eq!((hash_copies, chunk_copies), (1, 4));

    saf.select_batch(1).expect("batch 1 again");
    saf.run(2).expect("second run");
    assert_eq!(rig.hw.writes_to(MSR_COPY_SCAN_HASHES).len(), hash_copies);
    assert_eq!(rig.hw.writes_to(MSR_AUTHENTICATE_AND_COPY_CHUNK).len(), chunk_copies);
    assert_eq!(rig.firmware.requests.load(Ordering::SeqCst), 1);
}

#[test]
fn chunk_auth_error_marks_load_failed_and_later_runs_fail_fast() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.queue(MSR_SCAN_HASHES_STATUS, [hash_status(4)]);
    rig.hw.queue(
        MSR_CHUNKS_AUTHENTICATION_STATUS,
        [chunk_status(1, 0), chunk_status(1, 0x5)],
    );
    let saf = rig.saf();

    saf.select_batch(1).expect("batch 1");
    let error = saf.run(0).expect_err("load fails");
    assert!(matches!(error, IfsError::ChunkAuthFailed { code: 0x5, .. }));
    assert_eq!(error.class(), ErrorClass::Load);

    let state = saf.load_state();
    assert_eq!(state.valid_chunks, 1);
    assert!(!state.loaded);
    assert!(state.loading_error);
    assert_eq!(saf.loaded_version(), None);
    assert_eq!(saf.last_result(), RunResult::default());

    let before = rig.hw.accesses();
    assert_eq!(
        saf.run(0),
        Err(IfsError::NotLoaded {
            kind: TestKind::Saf
        })
    );
    assert_eq!(rig.hw.accesses(), before);
    assert_eq!(rig.isolations(), (0, 0));
}

#[test]
fn hash_count_mismatch_fails_the_load() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.queue(MSR_SCAN_HASHES_STATUS, [hash_status(5)]);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");
    assert!(matches!(
        saf.run(0),
        Err(IfsError::ChunkCountMismatch {
            hardware: 5,
            image: 4,
            ..
        })
    ));
    assert!(saf.load_state().loading_error);
    assert!(rig.hw.writes_to(MSR_AUTHENTICATE_AND_COPY_CHUNK).is_empty());
}

#[test]
fn offline_sibling_is_a_precondition_error() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    rig.hw.stick(MSR_SCAN_STATUS, 0);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");
    saf.run(0).expect("first run");

    rig.topology.offline.lock().expect("offline").insert(3);
    let error = saf.run(2).expect_err("sibling offline");
    assert_eq!(error, IfsError::SiblingOffline { cpu: 2, sibling: 3 });
    assert_eq!(error.class(), ErrorClass::Precondition);
    assert_eq!(saf.last_result(), RunResult::pass(0));
}

#[test]
fn interrupted_run_resumes_after_reported_chunk() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    let finished = run_status(3, 0);
    rig.hw.queue(MSR_SCAN_STATUS, [run_status(2, 0x9), finished]);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");

    let result = saf.run(0).expect("run");
    assert_eq!(result, RunResult::pass(finished));
    assert_eq!(rig.isolations(), (2, 2));

    let starts: Vec<u16> = rig
        .hw
        .writes_to(MSR_ACTIVATE_SCAN)
        .iter()
        .map(|(_, word)| LAYOUT.decode_activate(*word).start)
        .collect();
    assert_eq!(starts.len(), 4);
    assert_eq!(&starts[..2], &[0, 0]);
    assert_eq!(&starts[2..], &[3, 3]);
}

#[test]
fn clean_interrupt_with_chunks_remaining_resumes_at_next_chunk() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    rig.hw.queue(MSR_SCAN_STATUS, [run_status(2, 0x0), 0]);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");

    assert_eq!(saf.run(0).expect("run"), RunResult::pass(0));
    assert_eq!(rig.isolations(), (2, 2));

    let starts: Vec<u16> = rig
        .hw
        .writes_to(MSR_ACTIVATE_SCAN)
        .iter()
        .map(|(_, word)| LAYOUT.decode_activate(*word).start)
        .collect();
    assert_eq!(starts, [0, 0, 3, 3]);
}

#[test]
fn exhausted_restarts_report_partial_completion() {
    let config = IfsConfig {
        max_restarts: 3,
        run_timeout: Duration::from_secs(60),
        ..IfsConfig::default()
    };
    let rig = Rig::new(config);
    rig.hw.script_clean_load();
    rig.hw.stick(MSR_SCAN_STATUS, run_status(0, 0x1));
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");

    let result = saf.run(0).expect("run");
    assert_eq!(result, RunResult::fail(0xFE));
    assert_eq!(rig.isolations(), (4, 4));
}

#[test]
fn stalled_resume_point_counts_against_the_budget() {
    let config = IfsConfig {
        max_restarts: 2,
        run_timeout: Duration::from_secs(60),
        ..IfsConfig::default()
    };
    let rig = Rig::new(config);
    rig.hw.script_clean_load();
    rig.hw.queue(MSR_SCAN_STATUS, [run_status(1, 0x9)]);
    rig.hw.stick(MSR_SCAN_STATUS, run_status(1, 0x9));
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");

    assert_eq!(saf.run(0).expect("run"), RunResult::fail(0xFE));
    assert_eq!(saf.last_details(), 0xFE);
}

#[test]
fn wall_clock_bound_reports_timeout_and_releases_siblings() {
    let config = IfsConfig {
        run_timeout: Duration::ZERO,
        ..IfsConfig::default()
    };
    let rig = Rig::new(config);
    rig.hw.script_clean_load();
    rig.hw.stick(MSR_SCAN_STATUS, run_status(1, 0x9));
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");

    let result = saf.run(0).expect("run");
    assert_eq!(result, RunResult::fail(0xFD));
    let (pauses, resumes) = rig.isolations();
    assert_eq!(pauses, resumes);
    assert!(pauses >= 1);
}

#[test]
fn signature_error_is_a_failure_carrying_the_raw_word() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    let word = LAYOUT.encode_run_status(RunStatus {
        chunk_num: 1,
        chunk_stop_index: 4,
        error_code: 0,
        control_error: false,
        signature_error: true,
    });
    rig.hw.stick(MSR_SCAN_STATUS, word);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");
    assert_eq!(saf.run(0).expect("run"), RunResult::fail(word));
}

#[test]
fn status_read_fault_resumes_siblings_and_keeps_result() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    rig.hw.fault(MSR_SCAN_STATUS);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");

    let error = saf.run(0).expect_err("status read faults");
    assert_eq!(error.class(), ErrorClass::Hardware);
    assert_eq!(rig.isolations(), (1, 1));
    assert_eq!(saf.last_status(), TestStatus::NotTested);
}

#[test]
fn busy_core_is_rejected() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    rig.hw.stick(MSR_SCAN_STATUS, 0);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");

    let claim = rig.platform.claims().claim(0).expect("free core");
    assert_eq!(saf.run(1), Err(IfsError::CoreBusy { cpu: 1 }));
    drop(claim);
    assert!(saf.run(1).is_ok());
    assert!(!rig.platform.claims().is_claimed(0));
}

#[test]
fn unknown_cpu_is_rejected() {
    let rig = Rig::new(IfsConfig::default());
    let saf = rig.saf();
    assert_eq!(saf.run(64), Err(IfsError::UnknownCpu { cpu: 64 }));
}

#[test]
fn missing_image_is_a_provisioning_error_without_state_change() {
    let rig = Rig::new(IfsConfig::default());
    let saf = rig.saf();
    saf.select_batch(2).expect("batch 2");
    let error = saf.run(0).expect_err("missing image");
    assert_eq!(error.class(), ErrorClass::Provisioning);
    assert_eq!(saf.load_state().cur_batch, None);
    assert!(!saf.load_state().loading_error);
    assert!(rig.hw.writes_to(MSR_COPY_SCAN_HASHES).is_empty());
}

#[test]
fn unprovisioned_selection_keeps_failing_instead_of_running_the_resident_image() {
    let rig = Rig::new(IfsConfig::default());
    rig.hw.script_clean_load();
    rig.hw.stick(MSR_SCAN_STATUS, 0);
    let saf = rig.saf();
    saf.select_batch(1).expect("batch 1");
    saf.run(0).expect("first run");
    let activations = rig.hw.writes_to(MSR_ACTIVATE_SCAN).len();

    saf.select_batch(2).expect("batch 2");
    for _ in 0..2 {
        let error = saf.run(0).expect_err("batch 2 has no image");
        assert_eq!(error.class(), ErrorClass::Provisioning);
    }

    assert_eq!(rig.hw.writes_to(MSR_ACTIVATE_SCAN).len(), activations);
    assert_eq!(rig.firmware.requests.load(Ordering::SeqCst), 3);
    assert_eq!(saf.current_batch(), Some(2));
    assert_eq!(saf.last_result(), RunResult::pass(0));

    saf.select_batch(1).expect("back to batch 1");
    assert_eq!(saf.run(0).expect("resident image runs"), RunResult::pass(0));
}

#[test]
fn eager_load_happens_on_selection() {
    let config = IfsConfig {
        eager_load: true,
        ..IfsConfig::default()
    };
    let rig = Rig::new(config);
    rig.hw.script_clean_load();
    let saf = rig.saf();
    saf.select_batch(1).expect("eager load");
    assert!(saf.load_state().loaded);
    assert_eq!(rig.hw.writes_to(MSR_COPY_SCAN_HASHES).len(), 1);
}

#[test]
fn batch_rules() {
    let rig = Rig::new(IfsConfig::default());
    let saf = rig.saf();
    assert_eq!(saf.select_batch(0), Err(IfsError::InvalidBatch { batch: 0 }));
    assert_eq!(saf.current_batch(), None);

    let array = TestController::new(Arc::clone(&rig.platform), TestKind::ArrayBist)
        .expect("array supported");
    assert_eq!(
        array.select_batch(1),
        Err(IfsError::NoImage {
            kind: TestKind::ArrayBist
        })
    );
}

#[test]
fn unadvertised_test_type_is_unsupported() {
    let rig = Rig::new(IfsConfig::default());
    assert!(matches!(
        TestController::new(Arc::clone(&rig.platform), TestKind::Sbaf),
        Err(IfsError::Unsupported {
            kind: TestKind::Sbaf
        })
    ));
}
