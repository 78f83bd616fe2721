//! Per-controller load state and run results.

use crate::layout::RegisterLayout;
use crate::msr::{ArrayGeneration, Generation};

/// Outcome of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum TestStatus {
    /// No run has completed yet.
    #[default]
    NotTested,
    /// The last run completed without an error.
    Pass,
    /// The last run failed or could not finish.
    Fail,
}

impl TestStatus {
    /// Attribute spelling of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotTested => "untested",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

/// Status and raw details of the most recent completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RunResult {
    /// Pass/fail verdict.
    pub status: TestStatus,
    /// Raw status word, or a synthesized software code.
    pub details: u64,
}

impl RunResult {
    /// Passing result carrying `details`.
    #[must_use]
    pub const fn pass(details: u64) -> Self {
        Self {
            status: TestStatus::Pass,
            details,
        }
    }

    /// Failing result carrying `details`.
    #[must_use]
    pub const fn fail(details: u64) -> Self {
        Self {
            status: TestStatus::Fail,
            details,
        }
    }
}

/// What the hardware currently holds for one test type.
///
/// Values are only ever replaced as a whole; the loader builds the next state
/// on a copy and the controller swaps it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LoadState {
    /// An image is fully authenticated on every socket.
    pub loaded: bool,
    /// The last load attempt failed.
    pub loading_error: bool,
    /// Revision of the resident image.
    pub loaded_version: Option<u32>,
    /// Chunks authenticated by the last load, minimum across sockets.
    pub valid_chunks: u32,
    /// Batch of the last load attempt.
    pub cur_batch: Option<u32>,
    /// Scan register generation.
    pub generation: Generation,
    /// Chunk size reported by hardware.
    pub chunk_size: u32,
    /// Array-BIST generation.
    pub array_generation: ArrayGeneration,
    /// Highest SBAF bundle index.
    pub max_bundle: u16,
    /// Chunk count reported by hardware.
    pub num_chunks: u32,
    /// Cores that may be under test at once.
    pub max_core_limit: u16,
    /// Chunks per load stride (gen2).
    pub chunks_in_stride: u16,
}

impl LoadState {
    /// Empty state for a platform of the given generations.
    #[must_use]
    pub fn new(generation: Generation, array_generation: ArrayGeneration) -> Self {
        Self {
            generation,
            array_generation,
            ..Self::default()
        }
    }

    /// Register codec matching the detected generation.
    #[must_use]
    pub const fn layout(&self) -> RegisterLayout {
        RegisterLayout::for_generation(self.generation)
    }

    /// Copy of this state with the outcome of a load attempt cleared.
    #[must_use]
    pub const fn cleared(&self) -> Self {
        Self {
            loaded: false,
            loading_error: false,
            loaded_version: None,
            valid_chunks: 0,
            cur_batch: self.cur_batch,
            generation: self.generation,
            chunk_size: 0,
            array_generation: self.array_generation,
            max_bundle: 0,
            num_chunks: 0,
            max_core_limit: 0,
            chunks_in_stride: 0,
        }
    }
}
