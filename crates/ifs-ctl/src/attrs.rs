//! String-typed attribute surface over a [`TestController`].
//!
//! Each test type exposes five attributes. Values are parsed and rendered
//! the way the kernel's sysfs files present them:
//!
//! | attribute       | access | format                          |
//! |-----------------|--------|---------------------------------|
//! | `current_batch` | rw     | store: uint, show: `0x%x`/`none` |
//! | `run_test`      | w      | logical CPU id                  |
//! | `status`        | r      | `pass`, `fail` or `untested`    |
//! | `details`       | r      | `0x%x`                          |
//! | `image_version` | r      | `0x%x` or `none`                |

use std::fmt;

use ifs_core::{IfsError, TestController};
use thiserror::Error;
use tracing::debug;

/// One named attribute of a test device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Batch selection.
    CurrentBatch,
    /// Run trigger.
    RunTest,
    /// Verdict of the last run.
    Status,
    /// Raw status word of the last run.
    Details,
    /// Revision of the loaded image.
    ImageVersion,
}

impl Attribute {
    /// Every attribute in presentation order.
    pub const ALL: [Self; 5] = [
        Self::CurrentBatch,
        Self::RunTest,
        Self::Status,
        Self::Details,
        Self::ImageVersion,
    ];

    /// File name of the attribute.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CurrentBatch => "current_batch",
            Self::RunTest => "run_test",
            Self::Status => "status",
            Self::Details => "details",
            Self::ImageVersion => "image_version",
        }
    }

    /// Looks an attribute up by file name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.name() == name)
    }

    /// Whether the attribute accepts stores.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::CurrentBatch | Self::RunTest)
    }

    /// Whether the attribute can be shown.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(self, Self::RunTest)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure of a show or store.
#[derive(Debug, Error)]
pub enum AttrError {
    /// Store on a read-only attribute.
    #[error("{0} is read-only")]
    ReadOnly(Attribute),
    /// Show on a write-only attribute.
    #[error("{0} is write-only")]
    WriteOnly(Attribute),
    /// The stored text is not an unsigned integer.
    #[error("invalid value '{value}' for {attribute}")]
    InvalidValue {
        /// Target attribute.
        attribute: Attribute,
        /// Rejected text.
        value: String,
    },
    /// The controller rejected the operation.
    #[error(transparent)]
    Controller(#[from] IfsError),
}

/// Parses an unsigned integer the way `kstrtouint(.., 0, ..)` does:
/// `0x` hex, leading-`0` octal, otherwise decimal.
#[must_use]
pub fn parse_uint(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if text.len() > 1 && text.starts_with('0') {
        return u32::from_str_radix(&text[1..], 8).ok();
    }
    text.parse().ok()
}

/// Renders an attribute.
///
/// # Errors
///
/// Returns [`AttrError::WriteOnly`] for `run_test`.
pub fn show(controller: &TestController, attribute: Attribute) -> Result<String, AttrError> {
    Ok(match attribute {
        Attribute::CurrentBatch => controller
            .current_batch()
            .map_or_else(|| "none".to_string(), |batch| format!("{batch:#x}")),
        Attribute::RunTest => return Err(AttrError::WriteOnly(attribute)),
        Attribute::Status => controller.last_status().as_str().to_string(),
        Attribute::Details => format!("{:#x}", controller.last_details()),
        Attribute::ImageVersion => controller
            .loaded_version()
            .map_or_else(|| "none".to_string(), |version| format!("{version:#x}")),
    })
}

/// Applies a store to an attribute.
///
/// # Errors
///
/// Returns [`AttrError::ReadOnly`] for read-only attributes,
/// [`AttrError::InvalidValue`] for text that is not an unsigned integer, and
/// [`AttrError::Controller`] when the controller rejects the request.
pub fn store(controller: &TestController, attribute: Attribute, value: &str) -> Result<(), AttrError> {
    if !attribute.is_writable() {
        return Err(AttrError::ReadOnly(attribute));
    }
    let number = parse_uint(value).ok_or_else(|| AttrError::InvalidValue {
        attribute,
        value: value.to_string(),
    })?;
    debug!(test = %controller.kind(), %attribute, value = number, "store");
    match attribute {
        Attribute::CurrentBatch => controller.select_batch(number)?,
        _ => {
            controller.run(number)?;
        }
    }
    Ok(())
}
