//! Fixed-function pipeline state.

use bitflags::bitflags;
use tessera_core::{CompareOp, Format, Rect2D, Viewport};

/// How vertices are grouped into primitives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl PrimitiveTopology {
    pub const fn is_triangles(self) -> bool {
        matches!(
            self,
            Self::TriangleList | Self::TriangleStrip | Self::TriangleFan
        )
    }
}

/// Input assembly configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputAssemblyState {
    pub topology: PrimitiveTopology,
    /// Treat the all-ones index as a strip/fan restart marker
    pub primitive_restart: bool,
}

/// How triangles are filled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

/// Which triangle faces are discarded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

impl CullMode {
    pub const fn culls(self, front_facing: bool) -> bool {
        match self {
            Self::None => false,
            Self::Front => front_facing,
            Self::Back => !front_facing,
            Self::FrontAndBack => true,
        }
    }
}

/// Winding order, as seen in framebuffer space, of front-facing triangles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

/// Rasterization configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    /// Clamp depth instead of clipping against the near and far planes
    pub depth_clamp: bool,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            depth_clamp: false,
        }
    }
}

/// Operation applied to a stored stencil value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

impl StencilOp {
    /// New stencil value for `stored` given the dynamic `reference`.
    pub const fn apply(self, stored: u8, reference: u8) -> u8 {
        match self {
            Self::Keep => stored,
            Self::Zero => 0,
            Self::Replace => reference,
            Self::IncrementAndClamp => stored.saturating_add(1),
            Self::DecrementAndClamp => stored.saturating_sub(1),
            Self::Invert => !stored,
            Self::IncrementAndWrap => stored.wrapping_add(1),
            Self::DecrementAndWrap => stored.wrapping_sub(1),
        }
    }
}

/// Stencil configuration for one face.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilOpState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            compare_op: CompareOp::Always,
            compare_mask: 0xff,
            write_mask: 0xff,
        }
    }
}

/// Depth and stencil test configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: CompareOp,
    pub stencil_test: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
}

bitflags! {
    /// Faces addressed by a stencil state update.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StencilFaceFlags: u32 {
        const FRONT = 0x1;
        const BACK = 0x2;
        const FRONT_AND_BACK = 0x3;
    }
}

/// Blend factor applied to a source or destination term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
}

/// Operation combining the weighted source and destination terms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags! {
    /// Color channels written to an attachment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorComponentFlags: u32 {
        const R = 0x1;
        const G = 0x2;
        const B = 0x4;
        const A = 0x8;
        const RGBA = 0xf;
    }
}

impl Default for ColorComponentFlags {
    fn default() -> Self {
        Self::RGBA
    }
}

/// Blend configuration for one color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    pub color_write_mask: ColorComponentFlags,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            color_write_mask: ColorComponentFlags::RGBA,
        }
    }
}

impl ColorBlendAttachment {
    /// Classic `src * a + dst * (1 - a)` blending.
    pub fn alpha_blending() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: BlendFactor::SrcAlpha,
            dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::OneMinusSrcAlpha,
            ..Self::default()
        }
    }

    /// `src + dst` on every channel.
    pub fn additive() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::One,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::One,
            ..Self::default()
        }
    }
}

/// Whether a binding advances per vertex or per instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

/// A vertex buffer binding slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

/// A vertex attribute read from a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

/// Width of the entries of an index buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    #[default]
    U32,
}

impl IndexType {
    pub const fn size(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Index value that restarts strips and fans.
    pub const fn restart_value(self) -> u32 {
        match self {
            Self::U16 => tessera_core::constants::PRIMITIVE_RESTART_U16,
            Self::U32 => tessera_core::constants::PRIMITIVE_RESTART_U32,
        }
    }
}

/// State set by commands rather than baked into the pipeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DynamicState {
    pub viewport: Viewport,
    pub scissor: Rect2D,
    pub blend_constants: [f32; 4],
    /// Stencil reference for front and back faces
    pub stencil_reference: [u32; 2],
}

impl DynamicState {
    /// Viewport and scissor covering `area`, everything else zeroed.
    pub fn covering(area: Rect2D) -> Self {
        Self {
            viewport: Viewport {
                x: area.offset.x as f32,
                y: area.offset.y as f32,
                width: area.extent.width as f32,
                height: area.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: area,
            blend_constants: [0.0; 4],
            stencil_reference: [0; 2],
        }
    }
}
