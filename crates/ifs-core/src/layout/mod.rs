//! Bit-field codecs for the load and run registers.
//!
//! Scan-style registers come in two generations that differ only in the width
//! of the chunk count/index fields. [`RegisterLayout`] hides that difference
//! behind one decoded shape per register. Array-BIST and SBAF use their own
//! fixed layouts in [`array`] and [`sbaf`].

/// Array-BIST command and status layouts.
pub mod array;
/// SBAF activate and status layouts.
pub mod sbaf;

use crate::msr::Generation;

/// Extracts `width` bits starting at `shift`.
#[must_use]
pub(crate) const fn field(word: u64, shift: u32, width: u32) -> u64 {
    (word >> shift) & mask(width)
}

/// Places `value` (masked to `width` bits) at `shift`.
#[must_use]
pub(crate) const fn place(value: u64, shift: u32, width: u32) -> u64 {
    (value & mask(width)) << shift
}

const fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1 << width) - 1
    }
}

const fn flag(word: u64, bit: u32) -> bool {
    word & (1 << bit) != 0
}

const ERROR_CODE_SHIFT: u32 = 32;
const ERROR_CODE_WIDTH: u32 = 8;
const MAX_CORE_LIMIT_SHIFT: u32 = 51;
const MAX_CORE_LIMIT_WIDTH: u32 = 12;
const HASH_VALID_BIT: u32 = 63;
const CHUNKS_IN_STRIDE_SHIFT: u32 = 40;
const CHUNKS_IN_STRIDE_WIDTH: u32 = 9;
const MAX_BUNDLE_SHIFT: u32 = 48;
const MAX_BUNDLE_WIDTH: u32 = 16;
const DELAY_SHIFT: u32 = 32;
const DELAY_WIDTH: u32 = 31;
const SIGMCE_BIT: u32 = 63;
const CONTROL_ERROR_BIT: u32 = 62;
const SIGNATURE_ERROR_BIT: u32 = 63;

/// Decoded hash-copy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashStatus {
    /// Chunk size the hardware expects, in bytes.
    pub chunk_size: u16,
    /// Number of chunks described by the hash blob.
    pub num_chunks: u16,
    /// Hardware error code, zero on success.
    pub error_code: u8,
    /// Chunks per load stride (gen2 only, zero on gen0).
    pub chunks_in_stride: u16,
    /// Maximum number of cores that may be tested concurrently.
    pub max_core_limit: u16,
    /// Hash blob was accepted.
    pub valid: bool,
}

/// Decoded chunk authentication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkAuthStatus {
    /// Chunks authenticated so far.
    pub valid_chunks: u16,
    /// Chunks the hardware expects in total.
    pub total_chunks: u16,
    /// Hardware error code for the last chunk, zero on success.
    pub error_code: u8,
    /// Highest SBAF bundle index available (gen2 only).
    pub max_bundle: u16,
}

/// Activation command for a chunk range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivateCommand {
    /// First chunk to execute.
    pub start: u16,
    /// Chunk index the run stops at.
    pub stop: u16,
    /// Cycles each thread waits for its siblings.
    pub delay: u32,
    /// Signal a machine check on signature failure.
    pub sigmce: bool,
}

/// Decoded run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStatus {
    /// Last chunk the hardware executed.
    pub chunk_num: u16,
    /// Stop index the hardware was running towards.
    pub chunk_stop_index: u16,
    /// Hardware error code, zero on success.
    pub error_code: u8,
    /// Test control flow failed.
    pub control_error: bool,
    /// A chunk produced a bad signature.
    pub signature_error: bool,
}

impl RunStatus {
    /// True when neither error bit is set and the error code is zero.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.error_code == 0 && !self.control_error && !self.signature_error
    }
}

/// Generation-tagged codec for the scan-style registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegisterLayout {
    /// 8-bit counts and indices.
    #[default]
    Gen0,
    /// 16-bit counts and indices.
    Gen2,
}

impl RegisterLayout {
    /// Selects the codec for a detected generation.
    #[must_use]
    pub const fn for_generation(generation: Generation) -> Self {
        match generation {
            Generation::Gen0 => Self::Gen0,
            Generation::Gen2 => Self::Gen2,
        }
    }

    /// Width of chunk count and index fields.
    #[must_use]
    pub const fn index_width(self) -> u32 {
        match self {
            Self::Gen0 => 8,
            Self::Gen2 => 16,
        }
    }

    /// Largest chunk index the layout can carry.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn max_index(self) -> u16 {
        mask(self.index_width()) as u16
    }

    /// Decodes the hash-copy status register.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode_hash_status(self, word: u64) -> HashStatus {
        let (num_chunks, chunks_in_stride) = match self {
            Self::Gen0 => (field(word, 16, 8), 0),
            Self::Gen2 => (
                field(word, 16, 16),
                field(word, CHUNKS_IN_STRIDE_SHIFT, CHUNKS_IN_STRIDE_WIDTH),
            ),
        };
        HashStatus {
            chunk_size: field(word, 0, 16) as u16,
            num_chunks: num_chunks as u16,
            error_code: field(word, ERROR_CODE_SHIFT, ERROR_CODE_WIDTH) as u8,
            chunks_in_stride: chunks_in_stride as u16,
            max_core_limit: field(word, MAX_CORE_LIMIT_SHIFT, MAX_CORE_LIMIT_WIDTH) as u16,
            valid: flag(word, HASH_VALID_BIT),
        }
    }

    /// Encodes a hash-copy status word.
    #[must_use]
    pub const fn encode_hash_status(self, status: HashStatus) -> u64 {
        let mut word = place(status.chunk_size as u64, 0, 16)
            | place(status.num_chunks as u64, 16, self.index_width())
            | place(status.error_code as u64, ERROR_CODE_SHIFT, ERROR_CODE_WIDTH)
            | place(
                status.max_core_limit as u64,
                MAX_CORE_LIMIT_SHIFT,
                MAX_CORE_LIMIT_WIDTH,
            );
        if matches!(self, Self::Gen2) {
            word |= place(
                status.chunks_in_stride as u64,
                CHUNKS_IN_STRIDE_SHIFT,
                CHUNKS_IN_STRIDE_WIDTH,
            );
        }
        if status.valid {
            word |= 1 << HASH_VALID_BIT;
        }
        word
    }

    /// Decodes the chunk authentication status register.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode_chunk_auth(self, word: u64) -> ChunkAuthStatus {
        let width = self.index_width();
        let max_bundle = match self {
            Self::Gen0 => 0,
            Self::Gen2 => field(word, MAX_BUNDLE_SHIFT, MAX_BUNDLE_WIDTH),
        };
        ChunkAuthStatus {
            valid_chunks: field(word, 0, width) as u16,
            total_chunks: field(word, width, width) as u16,
            error_code: field(word, ERROR_CODE_SHIFT, ERROR_CODE_WIDTH) as u8,
            max_bundle: max_bundle as u16,
        }
    }

    /// Encodes a chunk authentication status word.
    #[must_use]
    pub const fn encode_chunk_auth(self, status: ChunkAuthStatus) -> u64 {
        let width = self.index_width();
        let mut word = place(status.valid_chunks as u64, 0, width)
            | place(status.total_chunks as u64, width, width)
            | place(status.error_code as u64, ERROR_CODE_SHIFT, ERROR_CODE_WIDTH);
        if matches!(self, Self::Gen2) {
            word |= place(status.max_bundle as u64, MAX_BUNDLE_SHIFT, MAX_BUNDLE_WIDTH);
        }
        word
    }

    /// Encodes an activation command.
    #[must_use]
    pub const fn encode_activate(self, command: ActivateCommand) -> u64 {
        let width = self.index_width();
        let mut word = place(command.start as u64, 0, width)
            | place(command.stop as u64, width, width)
            | place(command.delay as u64, DELAY_SHIFT, DELAY_WIDTH);
        if command.sigmce {
            word |= 1 << SIGMCE_BIT;
        }
        word
    }

    /// Decodes an activation command.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode_activate(self, word: u64) -> ActivateCommand {
        let width = self.index_width();
        ActivateCommand {
            start: field(word, 0, width) as u16,
            stop: field(word, width, width) as u16,
            delay: field(word, DELAY_SHIFT, DELAY_WIDTH) as u32,
            sigmce: flag(word, SIGMCE_BIT),
        }
    }

    /// Decodes the run status register.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode_run_status(self, word: u64) -> RunStatus {
        let width = self.index_width();
        RunStatus {
            chunk_num: field(word, 0, width) as u16,
            chunk_stop_index: field(word, width, width) as u16,
            error_code: field(word, ERROR_CODE_SHIFT, ERROR_CODE_WIDTH) as u8,
            control_error: flag(word, CONTROL_ERROR_BIT),
            signature_error: flag(word, SIGNATURE_ERROR_BIT),
        }
    }

    /// Encodes a run status word.
    #[must_use]
    pub const fn encode_run_status(self, status: RunStatus) -> u64 {
        let width = self.index_width();
        let mut word = place(status.chunk_num as u64, 0, width)
            | place(status.chunk_stop_index as u64, width, width)
            | place(status.error_code as u64, ERROR_CODE_SHIFT, ERROR_CODE_WIDTH);
        if status.control_error {
            word |= 1 << CONTROL_ERROR_BIT;
        }
        if status.signature_error {
            word |= 1 << SIGNATURE_ERROR_BIT;
        }
        word
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ActivateCommand, ChunkAuthStatus, HashStatus, RegisterLayout, RunStatus};

    #[test]
    fn gen0_hash_status_fields_sit_at_documented_offsets() {
        let word = 0x8000_0000_0000_0000 | (0x3 << 51) | (0x00 << 32) | (0x04 << 16) | 0x0040;
        let status = RegisterLayout::Gen0.decode_hash_status(word);
        assert_eq!(
            status,
            HashStatus {
                chunk_size: 0x40,
                num_chunks: 4,
                error_code: 0,
                chunks_in_stride: 0,
                max_core_limit: 3,
                valid: true,
            }
        );
    }

    #[test]
    fn gen0_ignores_reserved_bits_above_num_chunks() {
        let word = (0xAB << 24) | (0x04 << 16);
        assert_eq!(RegisterLayout::Gen0.decode_hash_status(word).num_chunks, 4);
        assert_eq!(RegisterLayout::Gen2.decode_hash_status(word).num_chunks, 0xAB04);
    }

    #[test]
    fn gen2_hash_status_carries_stride() {
        let status = HashStatus {
            chunk_size: 0x400,
            num_chunks: 300,
            error_code: 0,
            chunks_in_stride: 16,
            max_core_limit: 0xFFF,
            valid: true,
        };
        let word = RegisterLayout::Gen2.encode_hash_status(status);
        assert_eq!(RegisterLayout::Gen2.decode_hash_status(word), status);
    }

    #[test]
    fn error_code_shares_offset_across_generations() {
        let word = 0x05 << 32;
        for layout in [RegisterLayout::Gen0, RegisterLayout::Gen2] {
            assert_eq!(layout.decode_hash_status(word).error_code, 5);
            assert_eq!(layout.decode_chunk_auth(word).error_code, 5);
            assert_eq!(layout.decode_run_status(word).error_code, 5);
        }
    }

    #[rstest]
    #[case(RegisterLayout::Gen0, 0x0000_0000_0000_0403, 3, 4)]
    #[case(RegisterLayout::Gen2, 0x0000_0000_0004_0003, 3, 4)]
    fn chunk_auth_counts_follow_generation_width(
        #[case] layout: RegisterLayout,
        #[case] word: u64,
        #[case] valid: u16,
        #[case] total: u16,
    ) {
        let status = layout.decode_chunk_auth(word);
        assert_eq!(status.valid_chunks, valid);
        assert_eq!(status.total_chunks, total);
    }

    #[test]
    fn gen2_chunk_auth_reports_max_bundle() {
        let word = RegisterLayout::Gen2.encode_chunk_auth(ChunkAuthStatus {
            valid_chunks: 2,
            total_chunks: 2,
            error_code: 0,
            max_bundle: 7,
        });
        assert_eq!(word >> 48, 7);
        assert_eq!(RegisterLayout::Gen0.decode_chunk_auth(word).max_bundle, 0);
    }

    #[test]
    fn activate_encodes_start_stop_delay_and_sigmce() {
        let command = ActivateCommand {
            start: 3,
            stop: 4,
            delay: 100_000,
            sigmce: true,
        };
        let gen0 = RegisterLayout::Gen0.encode_activate(command);
        assert_eq!(gen0 & 0xFFFF, 0x0403);
        assert_eq!((gen0 >> 32) & 0x7FFF_FFFF, 100_000);
        assert_eq!(gen0 >> 63, 1);

        let gen2 = RegisterLayout::Gen2.encode_activate(command);
        assert_eq!(gen2 & 0xFFFF_FFFF, 0x0004_0003);
        assert_eq!(RegisterLayout::Gen2.decode_activate(gen2), command);
    }

    #[test]
    fn gen0_activate_truncates_wide_indices() {
        let command = ActivateCommand {
            start: 0x1FF,
            stop: 0x100,
            delay: 0,
            sigmce: false,
        };
        let decoded = RegisterLayout::Gen0.decode_activate(RegisterLayout::Gen0.encode_activate(command));
        assert_eq!(decoded.start, 0xFF);
        assert_eq!(decoded.stop, 0x00);
    }

    #[test]
    fn run_status_error_bits() {
        let word = (1 << 63) | (1 << 62) | (0x0B << 32) | 0x0402;
        let status = RegisterLayout::Gen0.decode_run_status(word);
        assert_eq!(
            status,
            RunStatus {
                chunk_num: 2,
                chunk_stop_index: 4,
                error_code: 0x0B,
                control_error: true,
                signature_error: true,
            }
        );
        assert!(!status.is_clean());
        assert!(RegisterLayout::Gen0.decode_run_status(0).is_clean());
    }

    #[test]
    fn max_index_matches_width() {
        assert_eq!(RegisterLayout::Gen0.max_index(), 0xFF);
        assert_eq!(RegisterLayout::Gen2.max_index(), 0xFFFF);
    }
}
