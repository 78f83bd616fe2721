//! Model-specific register map and test-type identities.

use std::fmt;

/// Array-BIST command/status register (gen0 array tests).
pub const MSR_ARRAY_BIST: u32 = 0x0000_0105;

/// SBAF: copy hash blob.
pub const MSR_COPY_SBAF_HASHES: u32 = 0x0000_02b8;
/// SBAF: hash copy status.
pub const MSR_SBAF_HASHES_STATUS: u32 = 0x0000_02b9;
/// SBAF: authenticate and copy one chunk.
pub const MSR_AUTHENTICATE_AND_COPY_SBAF_CHUNK: u32 = 0x0000_02ba;
/// SBAF: chunk authentication status.
pub const MSR_SBAF_CHUNKS_AUTHENTICATION_STATUS: u32 = 0x0000_02bb;
/// SBAF: activate a bundle/program.
pub const MSR_ACTIVATE_SBAF: u32 = 0x0000_02bc;
/// SBAF: run status.
pub const MSR_SBAF_STATUS: u32 = 0x0000_02bd;

/// SAF: copy hash blob.
pub const MSR_COPY_SCAN_HASHES: u32 = 0x0000_02c2;
/// SAF: hash copy status.
pub const MSR_SCAN_HASHES_STATUS: u32 = 0x0000_02c3;
/// SAF: authenticate and copy one chunk.
pub const MSR_AUTHENTICATE_AND_COPY_CHUNK: u32 = 0x0000_02c4;
/// SAF: chunk authentication status.
pub const MSR_CHUNKS_AUTHENTICATION_STATUS: u32 = 0x0000_02c5;
/// SAF: activate a chunk range.
pub const MSR_ACTIVATE_SCAN: u32 = 0x0000_02c6;
/// SAF: run status.
pub const MSR_SCAN_STATUS: u32 = 0x0000_02c7;

/// Array-BIST gen1 trigger register.
pub const MSR_ARRAY_TRIGGER: u32 = 0x0000_02d6;
/// Array-BIST gen1 status register.
pub const MSR_ARRAY_STATUS: u32 = 0x0000_02d7;
/// Integrity capabilities enumeration register.
pub const MSR_INTEGRITY_CAPS: u32 = 0x0000_02d9;

/// SAF test control register.
pub const MSR_SAF_CTRL: u32 = 0x0000_04f0;
/// SBAF test control register.
pub const MSR_SBAF_CTRL: u32 = 0x0000_04f8;

/// Test-control command that drops the currently installed stride (gen2).
pub const INVALIDATE_STRIDE: u64 = 0x1;

const CAPS_SAF_GEN_SHIFT: u32 = 9;
const CAPS_ARRAY_GEN_SHIFT: u32 = 13;
const CAPS_GEN_MASK: u64 = 0b11;

/// The three test types the hardware can run against a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum TestKind {
    /// Scan at Field: chunked scan image driven through activate/status.
    Saf,
    /// Array built-in self test: no image, bitmask walk over arrays.
    ArrayBist,
    /// Structural based functional test: bundles of programs from an image.
    Sbaf,
}

impl TestKind {
    /// Every test type in device-number order.
    pub const ALL: [Self; 3] = [Self::Saf, Self::ArrayBist, Self::Sbaf];

    /// Device instance number (`intel_ifs_<n>`).
    #[must_use]
    pub const fn test_num(self) -> u32 {
        match self {
            Self::Saf => 0,
            Self::ArrayBist => 1,
            Self::Sbaf => 2,
        }
    }

    /// Bit in the integrity capabilities register advertising this test.
    #[must_use]
    pub const fn integrity_cap_bit(self) -> u32 {
        match self {
            Self::Saf => 4,
            Self::ArrayBist => 2,
            Self::Sbaf => 8,
        }
    }

    /// File suffix of the test image, or `None` for imageless tests.
    #[must_use]
    pub const fn image_suffix(self) -> Option<&'static str> {
        match self {
            Self::Saf => Some("scan"),
            Self::ArrayBist => None,
            Self::Sbaf => Some("sbft"),
        }
    }

    /// Returns true when this test type needs a loaded image before it can run.
    #[must_use]
    pub const fn uses_image(self) -> bool {
        self.image_suffix().is_some()
    }

    /// Load/activate register block, for image-based tests.
    #[must_use]
    pub const fn msrs(self) -> Option<TestMsrs> {
        match self {
            Self::Saf => Some(TestMsrs {
                copy_hashes: MSR_COPY_SCAN_HASHES,
                copy_hashes_status: MSR_SCAN_HASHES_STATUS,
                copy_chunks: MSR_AUTHENTICATE_AND_COPY_CHUNK,
                copy_chunks_status: MSR_CHUNKS_AUTHENTICATION_STATUS,
                activate: MSR_ACTIVATE_SCAN,
                status: MSR_SCAN_STATUS,
                test_ctrl: MSR_SAF_CTRL,
            }),
            Self::ArrayBist => None,
            Self::Sbaf => Some(TestMsrs {
                copy_hashes: MSR_COPY_SBAF_HASHES,
                copy_hashes_status: MSR_SBAF_HASHES_STATUS,
                copy_chunks: MSR_AUTHENTICATE_AND_COPY_SBAF_CHUNK,
                copy_chunks_status: MSR_SBAF_CHUNKS_AUTHENTICATION_STATUS,
                activate: MSR_ACTIVATE_SBAF,
                status: MSR_SBAF_STATUS,
                test_ctrl: MSR_SBAF_CTRL,
            }),
        }
    }

    /// Short lowercase name used by the control surface.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Saf => "saf",
            Self::ArrayBist => "array",
            Self::Sbaf => "sbaf",
        }
    }

    /// Parses the short name produced by [`TestKind::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registers used by one image-based test type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestMsrs {
    /// Receives the hash blob address.
    pub copy_hashes: u32,
    /// Reports the outcome of the hash copy.
    pub copy_hashes_status: u32,
    /// Receives one chunk address per write.
    pub copy_chunks: u32,
    /// Reports chunk authentication progress.
    pub copy_chunks_status: u32,
    /// Starts a test run on the writing thread's core.
    pub activate: u32,
    /// Reports the outcome of the last run.
    pub status: u32,
    /// Test control (stride invalidation).
    pub test_ctrl: u32,
}

/// Scan register layout generation enumerated by hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Generation {
    /// 8-bit chunk counts and indices.
    #[default]
    Gen0,
    /// 16-bit chunk counts and indices, strided loading.
    Gen2,
}

impl Generation {
    /// Maps the raw capability field; every non-zero revision uses the wide layout.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        if raw == 0 {
            Self::Gen0
        } else {
            Self::Gen2
        }
    }
}

/// Array-BIST protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ArrayGeneration {
    /// Bitmask walk through `MSR_ARRAY_BIST`.
    #[default]
    Gen0,
    /// Single trigger/status pair.
    Gen1,
}

impl ArrayGeneration {
    /// Maps the raw capability field.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        if raw == 0 {
            Self::Gen0
        } else {
            Self::Gen1
        }
    }
}

/// Decoded view of `MSR_INTEGRITY_CAPS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntegrityCaps(pub u64);

impl IntegrityCaps {
    /// Returns true when the hardware advertises `kind`.
    #[must_use]
    pub const fn supports(self, kind: TestKind) -> bool {
        self.0 & (1 << kind.integrity_cap_bit()) != 0
    }

    /// Scan layout generation.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn generation(self) -> Generation {
        Generation::from_raw(((self.0 >> CAPS_SAF_GEN_SHIFT) & CAPS_GEN_MASK) as u8)
    }

    /// Array-BIST generation.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn array_generation(self) -> ArrayGeneration {
        ArrayGeneration::from_raw(((self.0 >> CAPS_ARRAY_GEN_SHIFT) & CAPS_GEN_MASK) as u8)
    }

    /// Builds a capability word, used by simulated hardware.
    #[must_use]
    pub const fn compose(kinds: &[TestKind], generation: Generation, array: ArrayGeneration) -> Self {
        let mut word = 0u64;
        let mut i = 0;
        while i < kinds.len() {
            word |= 1 << kinds[i].integrity_cap_bit();
            i += 1;
        }
        if matches!(generation, Generation::Gen2) {
            word |= 0b10 << CAPS_SAF_GEN_SHIFT;
        }
        if matches!(array, ArrayGeneration::Gen1) {
            word |= 0b01 << CAPS_ARRAY_GEN_SHIFT;
        }
        Self(word)
    }
}
