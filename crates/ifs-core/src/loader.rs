//! Two-phase image transfer into per-socket reserved memory.
//!
//! Phase one hands the hash blob to hardware and checks the geometry it
//! reports. Phase two authenticates chunks one at a time. Every socket
//! receives its own copy, loaded on the socket's first online CPU while that
//! socket's load lock is held.

use tracing::{debug, info, warn};

use crate::config::IfsConfig;
use crate::error::IfsError;
use crate::fault::{AuthErrorCode, HashErrorCode};
use crate::hw::{socket_leaders, CoreTopology, CpuId, HardwareChannel, SocketId};
use crate::image::TestImage;
use crate::isolation::SocketLocks;
use crate::layout::RegisterLayout;
use crate::msr::{Generation, TestKind, TestMsrs, INVALIDATE_STRIDE};
use crate::state::LoadState;

/// State produced by a load attempt together with its outcome.
///
/// The state is meaningful on failure too: it records `loading_error` and
/// the chunks that did authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Replacement load state.
    pub state: LoadState,
    /// Whether the image is now usable.
    pub result: Result<(), IfsError>,
}

/// Geometry and progress reported by one socket.
#[derive(Debug, Clone, Copy, Default)]
struct SocketLoad {
    valid_chunks: u32,
    num_chunks: u32,
    chunk_size: u32,
    max_core_limit: u16,
    chunks_in_stride: u16,
    max_bundle: u16,
}

/// Drives the load protocol for one image-based test type.
pub struct ImageLoader<'a> {
    hw: &'a dyn HardwareChannel,
    topology: &'a dyn CoreTopology,
    locks: &'a SocketLocks,
    config: &'a IfsConfig,
    kind: TestKind,
    msrs: TestMsrs,
}

impl<'a> ImageLoader<'a> {
    /// Builds a loader, or `None` when `kind` has no image.
    #[must_use]
    pub fn new(
        hw: &'a dyn HardwareChannel,
        topology: &'a dyn CoreTopology,
        locks: &'a SocketLocks,
        config: &'a IfsConfig,
        kind: TestKind,
    ) -> Option<Self> {
        let msrs = kind.msrs()?;
        Some(Self {
            hw,
            topology,
            locks,
            config,
            kind,
            msrs,
        })
    }

    /// Loads `image` on every socket and returns the replacement state.
    ///
    /// `base` supplies the platform generations; all load-derived fields of
    /// the returned state come from this attempt alone.
    #[must_use]
    pub fn load(&self, image: &TestImage, base: &LoadState) -> LoadReport {
        let mut state = base.cleared();
        state.cur_batch = Some(image.id().batch);
        let layout = state.layout();
        let expected = chunk_count(image);

        info!(kind = %self.kind, image = %image.id(), version = image.version(), "loading test image");

        let leaders = socket_leaders(self.topology);
        if leaders.is_empty() {
            state.loading_error = true;
            return LoadReport {
                state,
                result: Err(IfsError::IncompleteLoad {
                    socket: 0,
                    valid: 0,
                    expected,
                }),
            };
        }

        let mut valid_chunks = u32::MAX;
        for (socket, cpu) in leaders {
            let mut progress = SocketLoad::default();
            let outcome = self.locks.with_socket(socket, || {
                self.load_socket(socket, cpu, layout, state.generation, image, &mut progress)
            });
            valid_chunks = valid_chunks.min(progress.valid_chunks);
            state.valid_chunks = valid_chunks;
            state.num_chunks = progress.num_chunks;
            state.chunk_size = progress.chunk_size;
            state.max_core_limit = progress.max_core_limit;
            state.chunks_in_stride = progress.chunks_in_stride;
            state.max_bundle = progress.max_bundle;

            if let Err(error) = outcome {
                warn!(kind = %self.kind, image = %image.id(), %error, "test image load failed");
                state.loading_error = true;
                return LoadReport {
                    state,
                    result: Err(error),
                };
            }
        }

        state.loaded = true;
        state.loaded_version = Some(image.version());
        info!(
            kind = %self.kind,
            image = %image.id(),
            chunks = state.valid_chunks,
            "test image loaded"
        );
        LoadReport {
            state,
            result: Ok(()),
        }
    }

    fn load_socket(
        &self,
        socket: SocketId,
        cpu: CpuId,
        layout: RegisterLayout,
        generation: Generation,
        image: &TestImage,
        progress: &mut SocketLoad,
    ) -> Result<(), IfsError> {
        self.copy_hashes(socket, cpu, layout, image, progress)?;
        if generation == Generation::Gen2 {
            self.invalidate_stride(socket, cpu, layout)?;
        }
        self.copy_chunks(socket, cpu, layout, generation, image, progress)?;

        let expected = chunk_count(image);
        if progress.valid_chunks != expected {
            return Err(IfsError::IncompleteLoad {
                socket,
                valid: progress.valid_chunks,
                expected,
            });
        }
        Ok(())
    }

    fn copy_hashes(
        &self,
        socket: SocketId,
        cpu: CpuId,
        layout: RegisterLayout,
        image: &TestImage,
        progress: &mut SocketLoad,
    ) -> Result<(), IfsError> {
        self.hw
            .write(cpu, self.msrs.copy_hashes, image.hash_address())?;
        let status = layout.decode_hash_status(self.hw.read(cpu, self.msrs.copy_hashes_status)?);

        if !status.valid || status.error_code != 0 {
            let reason = match HashErrorCode::from_u8(status.error_code) {
                Some(code) => code.to_string(),
                None if status.error_code == 0 => "hash status not valid".to_string(),
                None => format!("unknown error code {:#04x}", status.error_code),
            };
            return Err(IfsError::HashInvalid {
                socket,
                code: status.error_code,
                reason,
            });
        }

        progress.num_chunks = u32::from(status.num_chunks);
        progress.chunk_size = u32::from(status.chunk_size);
        progress.max_core_limit = status.max_core_limit;
        progress.chunks_in_stride = status.chunks_in_stride;
        debug!(
            socket,
            chunks = status.num_chunks,
            chunk_size = status.chunk_size,
            max_cores = status.max_core_limit,
            "hashes accepted"
        );

        let image_chunks = chunk_count(image);
        if progress.num_chunks != image_chunks {
            return Err(IfsError::ChunkCountMismatch {
                socket,
                hardware: progress.num_chunks,
                image: image_chunks,
            });
        }
        if progress.chunk_size != image.chunk_size() {
            return Err(IfsError::ChunkSizeMismatch {
                socket,
                hardware: progress.chunk_size,
                image: image.chunk_size(),
            });
        }
        Ok(())
    }

    fn invalidate_stride(
        &self,
        socket: SocketId,
        cpu: CpuId,
        layout: RegisterLayout,
    ) -> Result<(), IfsError> {
        let resident = layout.decode_chunk_auth(self.hw.read(cpu, self.msrs.copy_chunks_status)?);
        if resident.valid_chunks == 0 {
            return Ok(());
        }
        debug!(socket, resident = resident.valid_chunks, "invalidating installed stride");
        self.hw.write(cpu, self.msrs.test_ctrl, INVALIDATE_STRIDE)?;
        let after = layout.decode_chunk_auth(self.hw.read(cpu, self.msrs.copy_chunks_status)?);
        if after.valid_chunks != 0 {
            return Err(IfsError::StrideInvalidateFailed { socket });
        }
        Ok(())
    }

    fn copy_chunks(
        &self,
        socket: SocketId,
        cpu: CpuId,
        layout: RegisterLayout,
        generation: Generation,
        image: &TestImage,
        progress: &mut SocketLoad,
    ) -> Result<(), IfsError> {
        let attempts = self.config.auth_attempts.max(1);
        for index in 0..image.num_chunks() {
            let address = image.chunk_address(index);
            let mut attempt = 1;
            loop {
                self.hw.write(cpu, self.msrs.copy_chunks, address)?;
                let status =
                    layout.decode_chunk_auth(self.hw.read(cpu, self.msrs.copy_chunks_status)?);
                progress.valid_chunks = u32::from(status.valid_chunks);
                progress.max_bundle = status.max_bundle;

                if status.error_code == 0 {
                    debug!(socket, chunk = index, valid = status.valid_chunks, "chunk authenticated");
                    break;
                }

                let interrupted = status.error_code == AuthErrorCode::Interrupted.as_u8();
                if generation == Generation::Gen2 && interrupted && attempt < attempts {
                    debug!(socket, chunk = index, attempt, "chunk authentication interrupted, retrying");
                    attempt += 1;
                    continue;
                }

                let reason = AuthErrorCode::from_u8(status.error_code).map_or_else(
                    || format!("unknown error code {:#04x}", status.error_code),
                    |code| code.to_string(),
                );
                return Err(IfsError::ChunkAuthFailed {
                    socket,
                    index: u32::try_from(index).unwrap_or(u32::MAX),
                    code: status.error_code,
                    reason,
                });
            }
        }
        Ok(())
    }
}

fn chunk_count(image: &TestImage) -> u32 {
    u32::try_from(image.num_chunks()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::ImageLoader;
    use crate::config::IfsConfig;
    use crate::error::IfsError;
    use crate::hw::{CoreTopology, CpuId, HardwareChannel, HwError, SocketId};
    use crate::image::{CpuSignature, ImageId, TestImage};
    use crate::isolation::SocketLocks;
    use crate::layout::{ChunkAuthStatus, HashStatus, RegisterLayout};
    use crate::msr::{
        ArrayGeneration, Generation, TestKind, MSR_AUTHENTICATE_AND_COPY_CHUNK,
        MSR_CHUNKS_AUTHENTICATION_STATUS, MSR_SAF_CTRL, MSR_SCAN_HASHES_STATUS,
    };
    use crate::state::LoadState;

    /// Answers reads from per-register queues and records writes.
    #[derive(Default)]
    struct Scripted {
        reads: Mutex<HashMap<u32, Vec<u64>>>,
        writes: Mutex<Vec<(CpuId, u32, u64)>>,
    }

    impl Scripted {
        fn queue(&self, reg: u32, words: impl IntoIterator<Item = u64>) {
            self.reads
                .lock()
                .expect("reads")
                .entry(reg)
                .or_default()
                .extend(words);
        }

        fn writes_to(&self, reg: u32) -> usize {
            self.writes
                .lock()
                .expect("writes")
                .iter()
                .filter(|(_, r, _)| *r == reg)
                .count()
        }
    }

    impl HardwareChannel for Scripted {
        fn read(&self, cpu: CpuId, reg: u32) -> Result<u64, HwError> {
            let mut reads = self.reads.lock().expect("reads");
            let queue = reads.get_mut(&reg).ok_or(HwError::ReadFault { cpu, reg })?;
            if queue.is_empty() {
                return Err(HwError::ReadFault { cpu, reg });
            }
            Ok(queue.remove(0))
        }

        fn write(&self, cpu: CpuId, reg: u32, value: u64) -> Result<(), HwError> {
            self.writes.lock().expect("writes").push((cpu, reg, value));
            Ok(())
        }
    }

    struct OneSocket;

    impl CoreTopology for OneSocket {
        fn siblings_of(&self, cpu: CpuId) -> Vec<CpuId> {
            vec![cpu]
        }

        fn is_online(&self, _cpu: CpuId) -> bool {
            true
        }

        fn socket_of(&self, _cpu: CpuId) -> Option<SocketId> {
            Some(0)
        }

        fn online_cpus(&self) -> Vec<CpuId> {
            vec![0, 1]
        }
    }

    fn image(chunks: usize) -> TestImage {
        TestImage::new(
            ImageId::new(CpuSignature::new(6, 0x8f, 6), 1),
            0x10,
            64,
            vec![0xAA; 32],
            vec![vec![0; 64]; chunks],
            0x10_0000,
        )
        .expect("image")
    }

    fn hash_ok(layout: RegisterLayout, chunks: u16) -> u64 {
        layout.encode_hash_status(HashStatus {
            chunk_size: 64,
            num_chunks: chunks,
            error_code: 0,
            chunks_in_stride: 0,
            max_core_limit: 4,
            valid: true,
        })
    }

    fn auth(layout: RegisterLayout, valid: u16, total: u16, error_code: u8) -> u64 {
        layout.encode_chunk_auth(ChunkAuthStatus {
            valid_chunks: valid,
            total_chunks: total,
            error_code,
            max_bundle: 0,
        })
    }

    fn run(hw: &Scripted, generation: Generation, chunks: usize) -> super::LoadReport {
        let locks = SocketLocks::new();
        let config = IfsConfig::default();
        let loader = ImageLoader::new(hw, &OneSocket, &locks, &config, TestKind::Saf)
            .expect("saf has an image");
        loader.load(&image(chunks), &LoadState::new(generation, ArrayGeneration::Gen0))
    }

    #[test]
    fn all_chunks_authenticate() {
        let hw = Scripted::default();
        let layout = RegisterLayout::Gen0;
        hw.queue(MSR_SCAN_HASHES_STATUS, [hash_ok(layout, 4)]);
        hw.queue(
            MSR_CHUNKS_AUTHENTICATION_STATUS,
            (1..=4).map(|n| auth(layout, n, 4, 0)),
        );

        let report = run(&hw, Generation::Gen0, 4);
        assert_eq!(report.result, Ok(()));
        assert!(report.state.loaded);
        assert!(!report.state.loading_error);
        assert_eq!(report.state.valid_chunks, 4);
        assert_eq!(report.state.loaded_version, Some(0x10));
        assert_eq!(report.state.max_core_limit, 4);
        assert_eq!(hw.writes_to(MSR_AUTHENTICATE_AND_COPY_CHUNK), 4);
    }

    #[test]
    fn chunk_error_stops_transfer() {
        let hw = Scripted::default();
        let layout = RegisterLayout::Gen0;
        hw.queue(MSR_SCAN_HASHES_STATUS, [hash_ok(layout, 4)]);
        hw.queue(
            MSR_CHUNKS_AUTHENTICATION_STATUS,
            [auth(layout, 1, 4, 0), auth(layout, 1, 4, 0x5)],
        );

        let report = run(&hw, Generation::Gen0, 4);
        assert!(matches!(
            report.result,
            Err(IfsError::ChunkAuthFailed { index: 1, code: 5, .. })
        ));
        assert!(!report.state.loaded);
        assert!(report.state.loading_error);
        assert_eq!(report.state.valid_chunks, 1);
        assert_eq!(hw.writes_to(MSR_AUTHENTICATE_AND_COPY_CHUNK), 2);
    }

    #[test]
    fn invalid_hash_status_is_a_load_failure() {
        let hw = Scripted::default();
        hw.queue(MSR_SCAN_HASHES_STATUS, [0x05 << 32]);
        let report = run(&hw, Generation::Gen0, 4);
        assert!(matches!(
            report.result,
            Err(IfsError::HashInvalid { code: 5, .. })
        ));
        assert!(report.state.loading_error);
        assert_eq!(hw.writes_to(MSR_AUTHENTICATE_AND_COPY_CHUNK), 0);
    }

    #[test]
    fn chunk_count_mismatch_is_a_load_failure() {
        let hw = Scripted::default();
        hw.queue(MSR_SCAN_HASHES_STATUS, [hash_ok(RegisterLayout::Gen0, 3)]);
        let report = run(&hw, Generation::Gen0, 4);
        assert!(matches!(
            report.result,
            Err(IfsError::ChunkCountMismatch {
                hardware: 3,
                image: 4,
                ..
            })
        ));
    }

    #[test]
    fn gen2_invalidates_resident_stride_and_retries_interrupted_auth() {
        let hw = Scripted::default();
        let layout = RegisterLayout::Gen2;
        hw.queue(MSR_SCAN_HASHES_STATUS, [hash_ok(layout, 2)]);
        hw.queue(
            MSR_CHUNKS_AUTHENTICATION_STATUS,
            [
                auth(layout, 2, 2, 0),
                auth(layout, 0, 2, 0),
                auth(layout, 0, 2, 0x5),
                auth(layout, 1, 2, 0),
                auth(layout, 2, 2, 0),
            ],
        );

        let report = run(&hw, Generation::Gen2, 2);
        assert_eq!(report.result, Ok(()));
        assert_eq!(hw.writes_to(MSR_SAF_CTRL), 1);
        assert_eq!(hw.writes_to(MSR_AUTHENTICATE_AND_COPY_CHUNK), 3);
    }

    #[test]
    fn gen2_stride_that_will_not_drop_fails() {
        let hw = Scripted::default();
        let layout = RegisterLayout::Gen2;
        hw.queue(MSR_SCAN_HASHES_STATUS, [hash_ok(layout, 2)]);
        hw.queue(
            MSR_CHUNKS_AUTHENTICATION_STATUS,
            [auth(layout, 2, 2, 0), auth(layout, 2, 2, 0)],
        );
        let report = run(&hw, Generation::Gen2, 2);
        assert_eq!(
            report.result,
            Err(IfsError::StrideInvalidateFailed { socket: 0 })
        );
    }

    #[test]
    fn register_fault_is_reported_as_hardware_error() {
        let hw = Scripted::default();
        let report = run(&hw, Generation::Gen0, 1);
        assert!(matches!(report.result, Err(IfsError::Hardware(_))));
        assert!(report.state.loading_error);
    }
}
