//! Array-BIST layouts.
//!
//! Gen0 uses one register for both the command and the result: software writes
//! the set of arrays still to test and reads back what remains. Gen1 collapses
//! the walk into a single trigger write and a status read.

use super::{field, place};

const BITMASK_WIDTH: u32 = 32;
const BANK_SHIFT: u32 = 32;
const BANK_WIDTH: u32 = 16;
const CTRL_RESULT_BIT: u32 = 63;

/// Gen1 trigger value that tests every array.
pub const ARRAY_GEN1_TEST_ALL_ARRAYS: u64 = 1 << 0;
/// Gen1 status bit reporting a failed array.
pub const ARRAY_GEN1_STATUS_FAIL: u64 = 1 << 0;

/// Gen0 Array-BIST command/status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArrayCommand {
    /// Arrays still to be tested.
    pub array_bitmask: u32,
    /// Bank within the current array.
    pub array_bank: u16,
    /// Set by hardware when a tested array failed.
    pub ctrl_result: bool,
}

impl ArrayCommand {
    /// Command that starts a full walk over every array.
    #[must_use]
    pub const fn all_arrays() -> Self {
        Self {
            array_bitmask: u32::MAX,
            array_bank: 0,
            ctrl_result: false,
        }
    }

    /// Decodes a raw register word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word: u64) -> Self {
        Self {
            array_bitmask: field(word, 0, BITMASK_WIDTH) as u32,
            array_bank: field(word, BANK_SHIFT, BANK_WIDTH) as u16,
            ctrl_result: word & (1 << CTRL_RESULT_BIT) != 0,
        }
    }

    /// Encodes into a raw register word.
    #[must_use]
    pub const fn encode(self) -> u64 {
        let word = place(self.array_bitmask as u64, 0, BITMASK_WIDTH)
            | place(self.array_bank as u64, BANK_SHIFT, BANK_WIDTH);
        if self.ctrl_result {
            word | (1 << CTRL_RESULT_BIT)
        } else {
            word
        }
    }

    /// True once hardware reports no arrays left.
    #[must_use]
    pub const fn is_done(self) -> bool {
        self.array_bitmask == 0
    }
}
