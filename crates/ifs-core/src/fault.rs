//! Named status codes read back from the hardware, plus the software codes
//! reported when a run cannot finish.

use thiserror::Error;

/// Run-status error codes reported by the scan and SBAF status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum ScanErrorCode {
    /// Test ran without a problem.
    #[error("no error")]
    NoError = 0x00,
    /// A sibling thread did not reach the rendezvous.
    #[error("other thread could not join")]
    OtherThreadCouldNotJoin = 0x01,
    /// An interrupt arrived before all threads met.
    #[error("interrupt occurred prior to scan coordination")]
    InterruptedBeforeRendezvous = 0x02,
    /// The core could not enter the required power state.
    #[error("core unable to enter power management state required for scan")]
    PowerMgmtInadequateForScan = 0x03,
    /// Start/stop indices do not describe a valid range.
    #[error("non valid chunks in the range")]
    InvalidChunkRange = 0x04,
    /// Threads wrote different activation commands.
    #[error("mismatch in arguments between threads of the same core")]
    MismatchArgumentsBetweenThreads = 0x05,
    /// The core cannot run the test right now.
    #[error("core not capable of performing scan currently")]
    CoreNotCapableCurrently = 0x06,
    /// Reserved code 7.
    #[error("unassigned error code 0x7")]
    UnassignedErrorCode = 0x07,
    /// Too many cores are under test at once.
    #[error("exceeded number of logical processors allowed for scan")]
    ExceedNumberOfThreadsConcurrent = 0x08,
    /// An interrupt stopped execution mid-run.
    #[error("interrupt occurred during scan execution")]
    InterruptedDuringExecution = 0x09,
    /// Reserved code 0xA.
    #[error("unassigned error code 0xA")]
    UnassignedErrorCodeA = 0x0A,
    /// A chunk was found corrupted at execution time.
    #[error("scan test image corrupted")]
    CorruptedChunk = 0x0B,
}

impl ScanErrorCode {
    /// Stable low byte of the status register error field.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Maps a raw error field back to a named code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::NoError),
            0x01 => Some(Self::OtherThreadCouldNotJoin),
            0x02 => Some(Self::InterruptedBeforeRendezvous),
            0x03 => Some(Self::PowerMgmtInadequateForScan),
            0x04 => Some(Self::InvalidChunkRange),
            0x05 => Some(Self::MismatchArgumentsBetweenThreads),
            0x06 => Some(Self::CoreNotCapableCurrently),
            0x07 => Some(Self::UnassignedErrorCode),
            0x08 => Some(Self::ExceedNumberOfThreadsConcurrent),
            0x09 => Some(Self::InterruptedDuringExecution),
            0x0A => Some(Self::UnassignedErrorCodeA),
            0x0B => Some(Self::CorruptedChunk),
            _ => None,
        }
    }

    /// The test may be activated again after this code.
    #[must_use]
    pub const fn can_restart(self) -> bool {
        matches!(
            self,
            Self::NoError
                | Self::OtherThreadCouldNotJoin
                | Self::InterruptedBeforeRendezvous
                | Self::PowerMgmtInadequateForScan
                | Self::ExceedNumberOfThreadsConcurrent
                | Self::InterruptedDuringExecution
        )
    }

    /// The hardware never started executing chunks.
    #[must_use]
    pub const fn not_started(self) -> bool {
        matches!(
            self,
            Self::OtherThreadCouldNotJoin
                | Self::InterruptedBeforeRendezvous
                | Self::PowerMgmtInadequateForScan
                | Self::ExceedNumberOfThreadsConcurrent
        )
    }
}

/// Error codes of the hash-copy status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum HashErrorCode {
    /// A previous hash copy is still running.
    #[error("attempt to copy scan hashes when copy already in progress")]
    CopyInProgress = 0x01,
    /// The reserved region is not configured.
    #[error("secure memory not set up correctly")]
    SecureMemoryNotSetUp = 0x02,
    /// Image does not belong to this processor.
    #[error("program id or family-model-stepping does not match")]
    ProgramIdMismatch = 0x03,
    /// Reserved code 4.
    #[error("reserved")]
    Reserved = 0x04,
    /// The hash blob failed its integrity check.
    #[error("integrity check failed")]
    IntegrityCheckFailed = 0x05,
    /// A reload or test is running on this socket.
    #[error("scan reload or test is in progress")]
    ReloadInProgress = 0x06,
}

impl HashErrorCode {
    /// Maps a raw error field to a named code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::CopyInProgress),
            0x02 => Some(Self::SecureMemoryNotSetUp),
            0x03 => Some(Self::ProgramIdMismatch),
            0x04 => Some(Self::Reserved),
            0x05 => Some(Self::IntegrityCheckFailed),
            0x06 => Some(Self::ReloadInProgress),
            _ => None,
        }
    }

    /// Stable raw value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Error codes of the chunk authentication status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum AuthErrorCode {
    /// Chunk was authenticated before.
    #[error("attempt to authenticate a chunk which is already marked as authentic")]
    AlreadyAuthentic = 0x01,
    /// Chunk hash did not match the hash blob.
    #[error("chunk authentication error, the hash of chunk did not match expected value")]
    HashMismatch = 0x02,
    /// Reserved code 3.
    #[error("reserved")]
    Reserved = 0x03,
    /// Chunk lies outside the installed stride.
    #[error("chunk outside the current stride")]
    OutsideStride = 0x04,
    /// Authentication was interrupted and may be retried.
    #[error("authentication flow interrupted")]
    Interrupted = 0x05,
}

impl AuthErrorCode {
    /// Maps a raw error field to a named code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::AlreadyAuthentic),
            0x02 => Some(Self::HashMismatch),
            0x03 => Some(Self::Reserved),
            0x04 => Some(Self::OutsideStride),
            0x05 => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Stable raw value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Status codes synthesized by software when hardware gives no terminal answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum SoftwareCode {
    /// Wall-clock bound elapsed before all chunks ran.
    #[error("software timeout")]
    Timeout = 0xFD,
    /// Restart budget ran out without forward progress.
    #[error("partial completion")]
    PartialCompletion = 0xFE,
}

impl SoftwareCode {
    /// Value reported through `details`.
    #[must_use]
    pub const fn details(self) -> u64 {
        self as u64
    }

    /// Recognises a synthesized `details` value.
    #[must_use]
    pub const fn from_details(details: u64) -> Option<Self> {
        match details {
            0xFD => Some(Self::Timeout),
            0xFE => Some(Self::PartialCompletion),
            _ => None,
        }
    }
}

/// Describes a raw run-status error code for log messages.
#[must_use]
pub fn describe_scan_code(code: u8) -> String {
    ScanErrorCode::from_u8(code).map_or_else(|| format!("unknown error code {code:#04x}"), |c| c.to_string())
}
