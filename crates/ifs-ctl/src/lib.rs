//! Control surface and scripted driver for the in-field core test controller.

/// Per-test attribute files: parsing and rendering.
pub mod attrs;
/// Driver scripts executed against the simulated machine.
pub mod script;

pub use attrs::{AttrError, Attribute};
pub use script::{parse_script, run_script, Report, ScriptError, Session};

use serde_json as _;
use tracing_subscriber as _;
#[cfg(test)]
use tempfile as _;
