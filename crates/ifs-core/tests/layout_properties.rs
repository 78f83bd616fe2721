//! Property coverage for the register codecs.

#![allow(clippy::pedantic, clippy::nursery)]

use ifs_core::layout::array::ArrayCommand;
use ifs_core::layout::sbaf::{SbafActivate, SbafOutcome, SbafStatus};
use ifs_core::{ActivateCommand, ChunkAuthStatus, HashStatus, RegisterLayout, RunStatus};
use proptest::prelude::*;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

fn layout() -> impl Strategy<Value = RegisterLayout> {
    prop_oneof![Just(RegisterLayout::Gen0), Just(RegisterLayout::Gen2)]
}

fn index(layout: RegisterLayout) -> impl Strategy<Value = u16> {
    0..=layout.max_index()
}

proptest! {
    #[test]
    fn activate_is_lossless_for_in_range_fields(
        (layout, start, stop) in layout().prop_flat_map(|l| (Just(l), index(l), index(l))),
        delay in 0u32..(1 << 31),
        sigmce in any::<bool>(),
    ) {
        let command = ActivateCommand { start, stop, delay, sigmce };
        prop_assert_eq!(layout.decode_activate(layout.encode_activate(command)), command);
    }

    #[test]
    fn run_status_is_lossless_for_in_range_fields(
        (layout, chunk_num, chunk_stop_index) in layout().prop_flat_map(|l| (Just(l), index(l), index(l))),
        error_code in any::<u8>(),
        control_error in any::<bool>(),
        signature_error in any::<bool>(),
    ) {
        let status = RunStatus { chunk_num, chunk_stop_index, error_code, control_error, signature_error };
        prop_assert_eq!(layout.decode_run_status(layout.encode_run_status(status)), status);
    }

    #[test]
    fn chunk_auth_is_lossless_for_in_range_fields(
        (layout, valid_chunks, total_chunks) in layout().prop_flat_map(|l| (Just(l), index(l), index(l))),
        error_code in any::<u8>(),
        max_bundle in any::<u16>(),
    ) {
        let status = ChunkAuthStatus { valid_chunks, total_chunks, error_code, max_bundle };
        let decoded = layout.decode_chunk_auth(layout.encode_chunk_auth(status));
        let expected_bundle = match layout {
            RegisterLayout::Gen0 => 0,
            RegisterLayout::Gen2 => max_bundle,
        };
        prop_assert_eq!(decoded, ChunkAuthStatus { max_bundle: expected_bundle, ..status });
    }

    #[test]
    fn hash_status_is_lossless_for_in_range_fields(
        (layout, num_chunks) in layout().prop_flat_map(|l| (Just(l), index(l))),
        chunk_size in any::<u16>(),
        error_code in any::<u8>(),
        chunks_in_stride in 0u16..0x200,
        max_core_limit in 0u16..0x1000,
        valid in any::<bool>(),
    ) {
        let status = HashStatus { chunk_size, num_chunks, error_code, chunks_in_stride, max_core_limit, valid };
        let decoded = layout.decode_hash_status(layout.encode_hash_status(status));
        let expected_stride = match layout {
            RegisterLayout::Gen0 => 0,
            RegisterLayout::Gen2 => chunks_in_stride,
        };
        prop_assert_eq!(decoded, HashStatus { chunks_in_stride: expected_stride, ..status });
    }

    #[test]
    fn gen0_truncates_wide_indices_to_eight_bits(start in any::<u16>(), stop in any::<u16>()) {
        let layout = RegisterLayout::Gen0;
        let decoded = layout.decode_activate(layout.encode_activate(ActivateCommand {
            start,
            stop,
            delay: 0,
            sigmce: false,
        }));
        prop_assert_eq!(decoded.start, start & 0xFF);
        prop_assert_eq!(decoded.stop, stop & 0xFF);
    }

    #[test]
    fn decoding_any_word_never_panics(word in any::<u64>()) {
        for layout in [RegisterLayout::Gen0, RegisterLayout::Gen2] {
            let _ = layout.decode_hash_status(word);
            let _ = layout.decode_chunk_auth(word);
            let _ = layout.decode_run_status(word);
        }
        let _ = ArrayCommand::decode(word);
        let status = SbafStatus::decode(word);
        prop_assert!(status.bundle_idx < 0x200);
        prop_assert!(status.pgm_idx < 4);
    }

    #[test]
    fn sbaf_words_roundtrip(
        bundle_idx in 0u16..0x200,
        pgm_idx in 0u8..4,
        delay in 0u32..(1 << 31),
        sigmce in any::<bool>(),
        error_code in any::<u8>(),
        test_fail in any::<bool>(),
        outcome in 0u8..4,
    ) {
        let activate = SbafActivate { bundle_idx, pgm_idx, delay, sigmce };
        prop_assert_eq!(SbafActivate::decode(activate.encode()), activate);

        let status = SbafStatus {
            bundle_idx,
            pgm_idx,
            error_code,
            test_fail,
            outcome: SbafOutcome::from_bits(outcome),
        };
        prop_assert_eq!(SbafStatus::decode(status.encode()), status);
    }

    #[test]
    fn array_command_roundtrips(bitmask in any::<u32>(), bank in any::<u16>(), ctrl in any::<bool>()) {
        let command = ArrayCommand { array_bitmask: bitmask, array_bank: bank, ctrl_result: ctrl };
        prop_assert_eq!(ArrayCommand::decode(command.encode()), command);
    }
}
