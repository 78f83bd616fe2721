//! Staging memory and a firmware provider that builds images on demand.
//!
//! Hash blobs use a small fixed header followed by one 64-bit digest per
//! chunk:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 3 | family, model, stepping |
//! | 4 | 4 | chunk size (LE) |
//! | 8 | 4 | chunk count (LE) |
//! | 12 | 2 | highest bundle index (LE) |
//! | 16 | 8 * n | chunk digests (LE) |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::image::{CpuSignature, FirmwareProvider, ImageId, ProvisionError, TestImage};
use crate::msr::TestKind;

const HEADER_LEN: usize = 16;
const DIGEST_LEN: usize = 8;
const SAF_BASE: u64 = 0x4000_0000;
const SBAF_BASE: u64 = 0x8000_0000;
const BATCH_STRIDE: u64 = 0x0100_0000;

/// 64-bit FNV-1a digest standing in for the image signature scheme.
#[must_use]
pub fn digest(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Parsed hash blob header and digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashBlob {
    /// Processor the image targets.
    pub signature: CpuSignature,
    /// Chunk size in bytes.
    pub chunk_size: u32,
    /// Highest bundle index (SBAF).
    pub max_bundle: u16,
    /// Digest per chunk.
    pub digests: Vec<u64>,
}

impl HashBlob {
    /// Serializes the blob.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let count = u32::try_from(self.digests.len()).unwrap_or(u32::MAX);
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.digests.len() * DIGEST_LEN);
        bytes.extend_from_slice(&[
            self.signature.family,
            self.signature.model,
            self.signature.stepping,
            0,
        ]);
        bytes.extend_from_slice(&self.chunk_size.to_le_bytes());
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend_from_slice(&self.max_bundle.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);
        for digest in &self.digests {
            bytes.extend_from_slice(&digest.to_le_bytes());
        }
        bytes
    }

    /// Parses a blob, or `None` when it is truncated.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..HEADER_LEN)?;
        let le32 = |at: usize| -> Option<u32> {
            Some(u32::from_le_bytes(header.get(at..at + 4)?.try_into().ok()?))
        };
        let chunk_size = le32(4)?;
        let count = usize::try_from(le32(8)?).ok()?;
        let max_bundle = u16::from_le_bytes([header[12], header[13]]);
        let body = bytes.get(HEADER_LEN..HEADER_LEN + count * DIGEST_LEN)?;
        let digests = body
            .chunks_exact(DIGEST_LEN)
            .map(|raw| {
                let mut word = [0u8; DIGEST_LEN];
                word.copy_from_slice(raw);
                u64::from_le_bytes(word)
            })
            .collect();
        Some(Self {
            signature: CpuSignature::new(header[0], header[1], header[2]),
            chunk_size,
            max_bundle,
            digests,
        })
    }
}

/// Byte regions staged at linear addresses.
#[derive(Debug, Default)]
pub struct SimMemory {
    regions: Mutex<HashMap<u64, Vec<u8>>>,
}

impl SimMemory {
    /// Empty memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `bytes` at `address`, replacing any region starting there.
    pub fn stage(&self, address: u64, bytes: Vec<u8>) {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, bytes);
    }

    /// Region starting at `address`.
    #[must_use]
    pub fn region(&self, address: u64) -> Option<Vec<u8>> {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }
}

/// Shape of an image the simulated firmware can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimImageSpec {
    /// Number of chunks.
    pub chunks: usize,
    /// Chunk size in bytes.
    pub chunk_size: u32,
    /// Length of the final chunk; `None` for a full chunk.
    pub last_chunk_len: Option<u32>,
    /// Image revision.
    pub version: u32,
    /// Highest bundle index recorded in the hash blob.
    pub max_bundle: u16,
    /// Processor the image was built for; `None` for the platform's own.
    pub built_for: Option<CpuSignature>,
    /// Chunk whose staged bytes are altered after hashing.
    pub corrupt_chunk: Option<usize>,
}

impl Default for SimImageSpec {
    fn default() -> Self {
        Self {
            chunks: 4,
            chunk_size: 64,
            last_chunk_len: None,
            version: 1,
            max_bundle: 0,
            built_for: None,
            corrupt_chunk: None,
        }
    }
}

/// Firmware provider that synthesizes deterministic images and stages them.
#[derive(Debug)]
pub struct SimFirmware {
    signature: CpuSignature,
    memory: Arc<SimMemory>,
    images: Mutex<HashMap<(TestKind, u32), SimImageSpec>>,
}

impl SimFirmware {
    /// Provider for a processor with `signature`, staging into `memory`.
    #[must_use]
    pub fn new(signature: CpuSignature, memory: Arc<SimMemory>) -> Self {
        Self {
            signature,
            memory,
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Makes batch `batch` of `kind` available.
    pub fn add_image(&self, kind: TestKind, batch: u32, spec: SimImageSpec) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, batch), spec);
    }

    /// Removes batch `batch` of `kind`.
    pub fn remove_image(&self, kind: TestKind, batch: u32) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, batch));
    }

    fn chunk_bytes(index: usize, len: u32, version: u32) -> Vec<u8> {
        (0..len)
            .map(|offset| {
                let seed = index.wrapping_mul(31) ^ offset as usize ^ version as usize;
                seed.to_le_bytes()[0]
            })
            .collect()
    }
}

impl FirmwareProvider for SimFirmware {
    fn load_image(&self, kind: TestKind, id: &ImageId) -> Result<TestImage, ProvisionError> {
        let base = match kind {
            TestKind::Saf => SAF_BASE,
            TestKind::Sbaf => SBAF_BASE,
            TestKind::ArrayBist => return Err(ProvisionError::NotFound { kind, id: *id }),
        };
        let spec = self
            .images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, id.batch))
            .copied()
            .ok_or(ProvisionError::NotFound { kind, id: *id })?;
        if id.signature != self.signature {
            return Err(ProvisionError::NotFound { kind, id: *id });
        }
        let built_for = spec.built_for.unwrap_or(self.signature);
        if built_for != id.signature {
            return Err(ProvisionError::VersionMismatch {
                kind,
                id: *id,
                found: built_for,
            });
        }
        if spec.chunk_size == 0 {
            return Err(ProvisionError::Malformed {
                reason: "chunk size is zero".to_string(),
            });
        }

        let chunks: Vec<Vec<u8>> = (0..spec.chunks)
            .map(|index| {
                let len = if index + 1 == spec.chunks {
                    spec.last_chunk_len.unwrap_or(spec.chunk_size)
                } else {
                    spec.chunk_size
                };
                Self::chunk_bytes(index, len, spec.version)
            })
            .collect();
        let blob = HashBlob {
            signature: built_for,
            chunk_size: spec.chunk_size,
            max_bundle: spec.max_bundle,
            digests: chunks.iter().map(|chunk| digest(chunk)).collect(),
        };

        let size = u64::from(spec.chunk_size);
        let raw_base = base + u64::from(id.batch) * BATCH_STRIDE;
        let image = TestImage::new(
            *id,
            spec.version,
            spec.chunk_size,
            blob.to_bytes(),
            chunks,
            raw_base.div_ceil(size) * size,
        )?;

        self.memory.stage(image.hash_address(), image.hashes().to_vec());
        for (index, chunk) in image.chunks().iter().enumerate() {
            let mut staged = chunk.clone();
            if spec.corrupt_chunk == Some(index) {
                if let Some(first) = staged.first_mut() {
                    *first ^= 0xFF;
                }
            }
            self.memory.stage(image.chunk_address(index), staged);
        }
        Ok(image)
    }
}
