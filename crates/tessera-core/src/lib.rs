//! Core types for the Tessera software device.
//!
//! This crate provides the foundational pieces shared by the rasterizer and
//! the device layer:
//! - Generation-checked handles and handle tables
//! - Texel formats with bit-exact encode/decode
//! - Geometry and clear-value types
//! - Fixed-point helpers for triangle setup

pub mod error;
pub mod format;
pub mod handle;
pub mod math;
pub mod types;

pub use error::{Error, Result};
pub use format::{Format, FormatInfo, NumericFormat, Texel};
pub use handle::{Handle, HandleTable, Registry};
pub use types::{
    ClearColorValue, ClearDepthStencilValue, ClearValue, CompareOp, Extent2D, Extent3D,
    ImageAspectFlags, Offset2D, Offset3D, Rect2D, Viewport,
};

/// Device-wide constants
pub mod constants {
    /// Sub-pixel precision of snapped screen coordinates, in bits
    pub const SUBPIXEL_BITS: u32 = 8;
    /// Sentinel index that restarts strip and fan topologies (32-bit indices)
    pub const PRIMITIVE_RESTART_U32: u32 = u32::MAX;
    /// Sentinel index that restarts strip and fan topologies (16-bit indices)
    pub const PRIMITIVE_RESTART_U16: u32 = u16::MAX as u32;
    /// Largest viewport width or height, in pixels
    pub const MAX_VIEWPORT_DIMENSION: u32 = 32768;
    /// Range every viewport edge must lie in, in pixels
    pub const VIEWPORT_BOUNDS_RANGE: [f32; 2] = [-65536.0, 65535.0];
    /// Timeout value that requests an unbounded wait
    pub const WAIT_FOREVER: u64 = u64::MAX;
}
