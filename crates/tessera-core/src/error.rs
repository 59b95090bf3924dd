//! Error types shared by all Tessera crates.

use thiserror::Error;

/// Leaf error type for handles, formats and bounds checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Handle does not name a live object
    #[error("Invalid {kind} handle: {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: u64 },

    /// Format is unknown or not usable for the requested operation
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Out of bounds access
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
