//! Errors returned by the controller, grouped into classes by who has to act on them.

use thiserror::Error;

use crate::hw::{CpuId, HwError, SocketId};
use crate::image::ProvisionError;
use crate::msr::TestKind;

/// Error classes used to decide whether controller state may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The firmware provider could not supply an image.
    Provisioning,
    /// Hardware rejected the image during loading.
    Load,
    /// The request could not start; nothing was touched.
    Precondition,
    /// A register access faulted.
    Hardware,
}

/// Errors surfaced by the controller, loader and executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IfsError {
    /// See [`ProvisionError`].
    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    /// The hash blob was rejected.
    #[error("socket {socket}: hash copy failed: {reason} (error code {code:#04x})")]
    HashInvalid {
        /// Socket being loaded.
        socket: SocketId,
        /// Raw hash status error code, zero when only the valid bit was clear.
        code: u8,
        /// Human readable reason.
        reason: String,
    },
    /// Hardware and image disagree on the number of chunks.
    #[error("socket {socket}: hardware expects {hardware} chunks, image has {image}")]
    ChunkCountMismatch {
        /// Socket being loaded.
        socket: SocketId,
        /// Count reported by hardware.
        hardware: u32,
        /// Count in the image.
        image: u32,
    },
    /// Hardware and image disagree on the chunk size.
    #[error("socket {socket}: hardware chunk size {hardware} does not match image chunk size {image}")]
    ChunkSizeMismatch {
        /// Socket being loaded.
        socket: SocketId,
        /// Size reported by hardware.
        hardware: u32,
        /// Size declared by the image.
        image: u32,
    },
    /// A chunk failed authentication.
    #[error("socket {socket}: chunk {index} authentication failed: {reason} (error code {code:#04x})")]
    ChunkAuthFailed {
        /// Socket being loaded.
        socket: SocketId,
        /// Index of the rejected chunk.
        index: u32,
        /// Raw error code.
        code: u8,
        /// Human readable reason.
        reason: String,
    },
    /// Fewer chunks authenticated than the image holds.
    #[error("socket {socket}: only {valid} of {expected} chunks authenticated")]
    IncompleteLoad {
        /// Socket being loaded.
        socket: SocketId,
        /// Chunks authenticated.
        valid: u32,
        /// Chunks expected.
        expected: u32,
    },
    /// The previously installed stride could not be dropped.
    #[error("socket {socket}: could not invalidate installed stride")]
    StrideInvalidateFailed {
        /// Socket being loaded.
        socket: SocketId,
    },

    /// No image is loaded for this test.
    #[error("no {kind} test image is loaded")]
    NotLoaded {
        /// Test type.
        kind: TestKind,
    },
    /// The hardware does not advertise this test type.
    #[error("{kind} tests are not supported by this processor")]
    Unsupported {
        /// Test type.
        kind: TestKind,
    },
    /// Batch numbers start at 1.
    #[error("batch {batch} is not a valid batch number")]
    InvalidBatch {
        /// Rejected batch.
        batch: u32,
    },
    /// The test type has no image and therefore no batches.
    #[error("{kind} tests do not use a test image")]
    NoImage {
        /// Test type.
        kind: TestKind,
    },
    /// The CPU is not known to the topology.
    #[error("cpu {cpu} does not exist")]
    UnknownCpu {
        /// Requested CPU.
        cpu: CpuId,
    },
    /// A sibling of the target core is offline.
    #[error("cpu {sibling} (sibling of cpu {cpu}) is offline")]
    SiblingOffline {
        /// Requested CPU.
        cpu: CpuId,
        /// Offline sibling.
        sibling: CpuId,
    },
    /// Another run owns the core.
    #[error("core of cpu {cpu} is already under test")]
    CoreBusy {
        /// Requested CPU.
        cpu: CpuId,
    },

    /// See [`HwError`].
    #[error(transparent)]
    Hardware(#[from] HwError),
}

impl IfsError {
    /// Returns the class of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Provisioning(_) => ErrorClass::Provisioning,
            Self::HashInvalid { .. }
            | Self::ChunkCountMismatch { .. }
            | Self::ChunkSizeMismatch { .. }
            | Self::ChunkAuthFailed { .. }
            | Self::IncompleteLoad { .. }
            | Self::StrideInvalidateFailed { .. } => ErrorClass::Load,
            Self::NotLoaded { .. }
            | Self::Unsupported { .. }
            | Self::InvalidBatch { .. }
            | Self::NoImage { .. }
            | Self::UnknownCpu { .. }
            | Self::SiblingOffline { .. }
            | Self::CoreBusy { .. } => ErrorClass::Precondition,
            Self::Hardware(_) => ErrorClass::Hardware,
        }
    }
}
