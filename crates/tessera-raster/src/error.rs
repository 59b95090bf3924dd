//! Rasterizer error types.

use thiserror::Error;

/// Errors raised while linking a pipeline or executing a draw.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RasterError {
    /// Stage signatures do not fit together or with the fixed-function state
    #[error("Shader link failed: {0}")]
    Link(String),

    /// Vertex attribute read past the end of its buffer
    #[error("Vertex fetch out of bounds: {0}")]
    VertexFetch(String),

    /// Index read past the end of the index buffer
    #[error("Index fetch out of bounds: {0}")]
    IndexFetch(String),

    /// Viewport larger than the supported dimensions or outside the bounds range
    #[error("Viewport out of range: {0}")]
    Viewport(String),

    /// Attachments do not match the pipeline
    #[error("Attachment mismatch: {0}")]
    Attachment(String),

    /// Format or bounds failure from the core layer
    #[error(transparent)]
    Core(#[from] tessera_core::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RasterError>;
