//! Device error types.

use tessera_raster::RasterError;
use thiserror::Error;

/// Device-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Host allocation or a host-visible heap ran out.
    #[error("Out of host memory: {0}")]
    OutOfHostMemory(String),

    /// A device-local heap ran out.
    #[error("Out of device memory: {0}")]
    OutOfDeviceMemory(String),

    /// Descriptor pool has no free sets left.
    #[error("Descriptor pool exhausted")]
    OutOfPoolMemory,

    /// Memory is not host-visible or is already mapped.
    #[error("Memory map failed: {0}")]
    MemoryMapFailed(String),

    /// Resource used before memory was bound to it.
    #[error("Resource accessed before memory was bound: {0}")]
    AccessBeforeBind(String),

    /// One-time command buffer reused without a reset.
    #[error("Invalid reuse: {0}")]
    InvalidReuse(String),

    /// Command buffer is not in the executable state.
    #[error("Command buffer not executable: {0}")]
    NotExecutable(String),

    /// Illegal command buffer state transition.
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Handle does not name a live object.
    #[error("Invalid {kind} handle: {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: u64 },

    /// Image layout does not match the access.
    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Unsupported format or out-of-range subresource or region.
    #[error("Invalid format or range: {0}")]
    InvalidFormatOrRange(String),

    /// API usage rule violated.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Wait did not complete in time.
    #[error("Timeout")]
    Timeout,

    /// Work completing the waited-on object failed.
    #[error("Submission failed")]
    SubmissionFailed,

    /// The device is lost; every later call fails.
    #[error("Device lost")]
    DeviceLost,

    /// Feature not supported by this device.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Draw failed inside the rasterizer.
    #[error("Rasterization failed: {0}")]
    Raster(RasterError),
}

impl DeviceError {
    /// `VkResult` value reported at the loader boundary.
    pub const fn result_code(&self) -> i32 {
        match self {
            Self::Timeout => 2,
            Self::OutOfHostMemory(_) => -1,
            Self::OutOfDeviceMemory(_) => -2,
            Self::DeviceLost => -4,
            Self::MemoryMapFailed(_) => -5,
            Self::Unsupported(_) => -8,
            Self::InvalidFormatOrRange(_) => -11,
            Self::PipelineCreation(_) | Self::SubmissionFailed | Self::Raster(_) => -13,
            Self::OutOfPoolMemory => -1_000_069_000,
            Self::AccessBeforeBind(_)
            | Self::InvalidReuse(_)
            | Self::NotExecutable(_)
            | Self::InvalidTransition(_)
            | Self::InvalidHandle { .. }
            | Self::LayoutMismatch(_)
            | Self::ValidationFailed(_) => -1_000_011_001,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }
}

impl From<tessera_core::Error> for DeviceError {
    fn from(err: tessera_core::Error) -> Self {
        use tessera_core::Error;
        match err {
            Error::InvalidHandle { kind, raw } => Self::InvalidHandle { kind, raw },
            Error::UnsupportedFormat(msg) | Error::OutOfBounds(msg) => {
                Self::InvalidFormatOrRange(msg)
            }
            Error::InvalidData(msg) => Self::ValidationFailed(msg),
        }
    }
}

impl From<RasterError> for DeviceError {
    fn from(err: RasterError) -> Self {
        match err {
            RasterError::Link(msg) => Self::PipelineCreation(msg),
            RasterError::Core(err) => err.into(),
            other => Self::Raster(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_follow_vk_result() {
        assert_eq!(DeviceError::Timeout.result_code(), 2);
        assert_eq!(DeviceError::DeviceLost.result_code(), -4);
        assert_eq!(DeviceError::OutOfPoolMemory.result_code(), -1_000_069_000);
        assert_eq!(
            DeviceError::validation("draw outside rendering").result_code(),
            -1_000_011_001
        );
    }

    #[test]
    fn core_and_raster_errors_convert() {
        let handle = tessera_core::Error::InvalidHandle {
            kind: "Buffer",
            raw: 0x1_0000_0003,
        };
        assert_eq!(
            DeviceError::from(handle),
            DeviceError::InvalidHandle {
                kind: "Buffer",
                raw: 0x1_0000_0003
            }
        );
        assert!(matches!(
            DeviceError::from(RasterError::Link("bad".into())),
            DeviceError::PipelineCreation(_)
        ));
        assert!(matches!(
            DeviceError::from(RasterError::VertexFetch("oob".into())),
            DeviceError::Raster(_)
        ));
    }
}
