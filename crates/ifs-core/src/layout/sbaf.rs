//! SBAF activate/status layouts.

use super::{field, place};

const BUNDLE_WIDTH: u32 = 9;
const PGM_SHIFT: u32 = 14;
const PGM_WIDTH: u32 = 2;
const DELAY_SHIFT: u32 = 32;
const DELAY_WIDTH: u32 = 31;
const SIGMCE_BIT: u32 = 63;
const ERROR_CODE_SHIFT: u32 = 32;
const TEST_FAIL_BIT: u32 = 61;
const SBAF_STATUS_SHIFT: u32 = 62;

/// Number of programs in each bundle.
pub const SBAF_PROGRAMS_PER_BUNDLE: u8 = 4;

/// Two-bit outcome field of the SBAF status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SbafOutcome {
    /// Bundle completed.
    Pass,
    /// A program produced a bad signature.
    SignatureFail,
    /// Execution was interrupted.
    Interrupted,
    /// The test itself detected a failure.
    TestFail,
}

impl SbafOutcome {
    /// Maps the two-bit field.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Pass,
            1 => Self::SignatureFail,
            2 => Self::Interrupted,
            _ => Self::TestFail,
        }
    }

    /// Two-bit encoding.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::SignatureFail => 1,
            Self::Interrupted => 2,
            Self::TestFail => 3,
        }
    }
}

/// SBAF activation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbafActivate {
    /// Bundle to run.
    pub bundle_idx: u16,
    /// First program within the bundle.
    pub pgm_idx: u8,
    /// Cycles each thread waits for its siblings.
    pub delay: u32,
    /// Signal a machine check on signature failure.
    pub sigmce: bool,
}

impl SbafActivate {
    /// Encodes into a raw register word.
    #[must_use]
    pub const fn encode(self) -> u64 {
        let word = place(self.bundle_idx as u64, 0, BUNDLE_WIDTH)
            | place(self.pgm_idx as u64, PGM_SHIFT, PGM_WIDTH)
            | place(self.delay as u64, DELAY_SHIFT, DELAY_WIDTH);
        if self.sigmce {
            word | (1 << SIGMCE_BIT)
        } else {
            word
        }
    }

    /// Decodes a raw register word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word: u64) -> Self {
        Self {
            bundle_idx: field(word, 0, BUNDLE_WIDTH) as u16,
            pgm_idx: field(word, PGM_SHIFT, PGM_WIDTH) as u8,
            delay: field(word, DELAY_SHIFT, DELAY_WIDTH) as u32,
            sigmce: word & (1 << SIGMCE_BIT) != 0,
        }
    }
}

/// Decoded SBAF status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbafStatus {
    /// Bundle the hardware stopped in.
    pub bundle_idx: u16,
    /// Program the hardware stopped at.
    pub pgm_idx: u8,
    /// Hardware error code.
    pub error_code: u8,
    /// Test failure flag.
    pub test_fail: bool,
    /// Outcome of the bundle.
    pub outcome: SbafOutcome,
}

impl SbafStatus {
    /// Decodes a raw register word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word: u64) -> Self {
        Self {
            bundle_idx: field(word, 0, BUNDLE_WIDTH) as u16,
            pgm_idx: field(word, PGM_SHIFT, PGM_WIDTH) as u8,
            error_code: field(word, ERROR_CODE_SHIFT, 8) as u8,
            test_fail: word & (1 << TEST_FAIL_BIT) != 0,
            outcome: SbafOutcome::from_bits(field(word, SBAF_STATUS_SHIFT, 2) as u8),
        }
    }

    /// Encodes into a raw register word.
    #[must_use]
    pub const fn encode(self) -> u64 {
        let mut word = place(self.bundle_idx as u64, 0, BUNDLE_WIDTH)
            | place(self.pgm_idx as u64, PGM_SHIFT, PGM_WIDTH)
            | place(self.error_code as u64, ERROR_CODE_SHIFT, 8)
            | place(self.outcome.bits() as u64, SBAF_STATUS_SHIFT, 2);
        if self.test_fail {
            word |= 1 << TEST_FAIL_BIT;
        }
        word
    }

    /// A bundle finished with nothing to report.
    #[must_use]
    pub const fn bundle_completed(&self) -> bool {
        self.error_code == 0 && matches!(self.outcome, SbafOutcome::Pass)
    }
}
