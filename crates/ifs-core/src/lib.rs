//! In-field core test controller.
//!
//! Loads hashed test images into per-socket reserved memory and runs them
//! on isolated physical cores, interpreting the hardware status words.

/// Model-specific register map, test types and capability decoding.
pub mod msr;
pub use msr::{ArrayGeneration, Generation, IntegrityCaps, TestKind, TestMsrs};

/// Register bit-field codecs.
pub mod layout;
pub use layout::{
    ActivateCommand, ChunkAuthStatus, HashStatus, RegisterLayout, RunStatus,
};

/// Named hardware and software status codes.
pub mod fault;
pub use fault::{describe_scan_code, AuthErrorCode, HashErrorCode, ScanErrorCode, SoftwareCode};

/// Collaborator traits for registers, topology and scheduling.
pub mod hw;
pub use hw::{
    socket_leaders, CoreTopology, CpuId, HardwareChannel, HwError, NoopScheduler,
    SiblingScheduler, SocketId,
};

/// Test images and the firmware provider contract.
pub mod image;
pub use image::{CpuSignature, FirmwareProvider, ImageId, ProvisionError, TestImage};

/// Controller error taxonomy.
pub mod error;
pub use error::{ErrorClass, IfsError};

/// Controller configuration.
pub mod config;
pub use config::IfsConfig;

/// Load state and run results.
pub mod state;
pub use state::{LoadState, RunResult, TestStatus};

/// Resident image cache.
pub mod cache;
pub use cache::{LoadCache, ResidentImage};

/// Rendezvous, isolation guard, core claims and socket locks.
pub mod isolation;
pub use isolation::{CoreClaim, CoreClaims, Isolation, Rendezvous, SocketLocks};

/// Two-phase image loader.
pub mod loader;
pub use loader::{ImageLoader, LoadReport};

/// Test execution on isolated cores.
pub mod executor;
pub use executor::{CoreTestExecutor, CoreTestRun};

/// Per-test-type controller.
pub mod controller;
pub use controller::{Platform, TestController};

/// Simulated hardware and collaborators.
#[cfg(feature = "sim")]
pub mod sim;

#[cfg(test)]
use proptest as _;
