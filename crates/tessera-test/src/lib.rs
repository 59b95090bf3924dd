//! Test harness for the Tessera device.
//!
//! Provides headless rendering, error-mask image comparison, visual
//! regression testing and the end-to-end scenarios.

pub mod harness;
pub mod mask;
pub mod scenarios;

pub use harness::{HeadlessRenderer, PassClear, VisualRegressionTest};
pub use mask::{compare_with_mask, ErrorMask, MaskReport};
pub use scenarios::Scenario;

use tessera_device::DeviceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Visual regression test configuration.
#[derive(Debug, Clone)]
pub struct VisualTestConfig {
    /// Directory for baseline images.
    pub baseline_dir: String,
    /// Directory for test output images.
    pub output_dir: String,
    /// Write missing baselines instead of failing.
    pub create_missing: bool,
}

impl Default for VisualTestConfig {
    fn default() -> Self {
        Self {
            baseline_dir: "assets/test_data/baselines".to_string(),
            output_dir: "target/test_output".to_string(),
            create_missing: true,
        }
    }
}
