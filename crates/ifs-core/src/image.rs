//! Test images and the firmware provider contract.

use std::fmt;

use thiserror::Error;

use crate::msr::TestKind;

/// Family/model/stepping triple identifying a processor revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CpuSignature {
    /// Display family.
    pub family: u8,
    /// Display model.
    pub model: u8,
    /// Stepping.
    pub stepping: u8,
}

impl CpuSignature {
    /// Builds a signature.
    #[must_use]
    pub const fn new(family: u8, model: u8, stepping: u8) -> Self {
        Self {
            family,
            model,
            stepping,
        }
    }
}

impl fmt::Display for CpuSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{:02x}-{:02x}",
            self.family, self.model, self.stepping
        )
    }
}

/// A selectable test image: processor signature plus batch number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ImageId {
    /// Processor the image was built for.
    pub signature: CpuSignature,
    /// 1-based batch number.
    pub batch: u32,
}

impl ImageId {
    /// Builds an identifier.
    #[must_use]
    pub const fn new(signature: CpuSignature, batch: u32) -> Self {
        Self { signature, batch }
    }

    /// Firmware file name for `kind`, e.g. `06-8f-06-02.scan`.
    #[must_use]
    pub fn file_name(&self, kind: TestKind) -> Option<String> {
        kind.image_suffix()
            .map(|suffix| format!("{}-{:02x}.{suffix}", self.signature, self.batch))
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02x}", self.signature, self.batch)
    }
}

/// Why a provider could not hand out an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ProvisionError {
    /// No image exists for this identifier.
    #[error("no {kind} test image {id}")]
    NotFound {
        /// Requested test type.
        kind: TestKind,
        /// Requested image.
        id: ImageId,
    },
    /// The image exists but targets a different processor.
    #[error("{kind} test image {id} was built for {found}")]
    VersionMismatch {
        /// Requested test type.
        kind: TestKind,
        /// Requested image.
        id: ImageId,
        /// Signature embedded in the image.
        found: CpuSignature,
    },
    /// The image violates the chunk layout rules.
    #[error("malformed test image: {reason}")]
    Malformed {
        /// What was wrong.
        reason: String,
    },
}

/// A hashed test image staged in memory by a [`FirmwareProvider`].
///
/// The hash blob sits at `base_address`; chunk data starts at the next
/// `chunk_size` boundary after it and chunks are contiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestImage {
    id: ImageId,
    version: u32,
    chunk_size: u32,
    hashes: Vec<u8>,
    chunks: Vec<Vec<u8>>,
    base_address: u64,
}

impl TestImage {
    /// Builds an image, checking the chunk layout.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Malformed`] when there are no chunks, the chunk
    /// size is zero, the base address is not chunk aligned, any chunk is larger
    /// than `chunk_size`, or a chunk other than the last is short.
    pub fn new(
        id: ImageId,
        version: u32,
        chunk_size: u32,
        hashes: Vec<u8>,
        chunks: Vec<Vec<u8>>,
        base_address: u64,
    ) -> Result<Self, ProvisionError> {
        let malformed =
            |reason: String| -> Result<Self, ProvisionError> { Err(ProvisionError::Malformed { reason }) };
        if chunk_size == 0 {
            return malformed("chunk size is zero".to_string());
        }
        if chunks.is_empty() {
            return malformed("image has no chunks".to_string());
        }
        if base_address % u64::from(chunk_size) != 0 {
            return malformed(format!(
                "base address {base_address:#x} is not aligned to {chunk_size:#x}"
            ));
        }
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.iter().enumerate() {
            let len = chunk.len();
            let limit = chunk_size as usize;
            if len > limit || (index != last && len != limit) || len == 0 {
                return malformed(format!(
                    "chunk {index} is {len} bytes, expected {chunk_size}"
                ));
            }
        }
        Ok(Self {
            id,
            version,
            chunk_size,
            hashes,
            chunks,
            base_address,
        })
    }

    /// Identifier this image was requested under.
    #[must_use]
    pub const fn id(&self) -> ImageId {
        self.id
    }

    /// Image revision.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Declared chunk size in bytes.
    #[must_use]
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of chunks.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Hash blob bytes.
    #[must_use]
    pub fn hashes(&self) -> &[u8] {
        &self.hashes
    }

    /// Chunk payloads in order.
    #[must_use]
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Linear address of the hash blob.
    #[must_use]
    pub const fn hash_address(&self) -> u64 {
        self.base_address
    }

    /// Linear address of the first chunk.
    #[must_use]
    pub fn data_address(&self) -> u64 {
        let size = u64::from(self.chunk_size);
        let hash_len = self.hashes.len() as u64;
        self.base_address + hash_len.div_ceil(size).max(1) * size
    }

    /// Linear address of chunk `index`.
    #[must_use]
    pub fn chunk_address(&self, index: usize) -> u64 {
        self.data_address() + index as u64 * u64::from(self.chunk_size)
    }
}

/// Source of test images.
pub trait FirmwareProvider: Send + Sync {
    /// Fetches and stages the image `id` for `kind`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProvisionError`] when no matching image can be produced.
    fn load_image(&self, kind: TestKind, id: &ImageId) -> Result<TestImage, ProvisionError>;
}
