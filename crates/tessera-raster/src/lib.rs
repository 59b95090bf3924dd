//! Software rasterization pipeline for the Tessera device.
//!
//! A draw runs every stage in order:
//! vertex fetch, vertex stage, primitive assembly, clipping, rasterization,
//! fragment stage, depth/stencil test, then blend and write.
//!
//! The pipeline works on decoded inputs only: vertex and index bytes,
//! descriptor snapshots and [`Surface`] attachments. Memory, layouts and
//! synchronization belong to the device layer.

mod assembly;
mod clip;
pub mod draw;
pub mod error;
mod line;
mod output;
pub mod pipeline;
mod point;
pub mod resources;
pub mod sampler;
pub mod shader;
pub mod stages;
pub mod state;
pub mod surface;
mod triangle;
mod vertex;

pub use draw::{draw, DrawCall, DrawInputs, DrawStats, Framebuffer, IndexInput};
pub use error::{RasterError, Result};
pub use pipeline::{GraphicsPipeline, PipelineState};
pub use resources::{BoundTexture, DescriptorBindings};
pub use sampler::{AddressMode, BorderColor, Filter, SamplerState};
pub use shader::{
    Builtin, Interpolation, ShaderContext, ShaderStage, Signature, Slot, SlotBinding, StageKind,
    Value, ValueType,
};
pub use stages::{
    ConstantColor, FnStage, FullscreenTriangle, PassThroughVertex, TexturedFragment, VaryingColor,
};
pub use state::{
    BlendFactor, BlendOp, ColorBlendAttachment, ColorComponentFlags, CullMode,
    DepthStencilState, DynamicState, FrontFace, IndexType, InputAssemblyState, PolygonMode,
    PrimitiveTopology, RasterizationState, StencilFaceFlags, StencilOp, StencilOpState,
    VertexAttribute, VertexBinding, VertexInputRate,
};
pub use surface::Surface;
