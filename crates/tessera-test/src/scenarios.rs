//! End-to-end rendering scenarios with analytic reference images.
//!
//! Every scenario renders on its own validation-enabled device. The
//! reference image and mask come from closed-form expectations, not from a
//! second renderer.

use glam::{Vec2, Vec4};
use image::{ImageBuffer, Rgba, RgbaImage};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tessera_core::{CompareOp, Format, Rect2D};
use tessera_device::{
    write_sampled_image, BufferUsageFlags, DescriptorSetLayoutBuilder, GraphicsPipelineConfig,
    MemoryBarrier, PipelineStageFlags, ShaderStageFlags,
};
use tessera_raster::{
    AddressMode, ColorBlendAttachment, ConstantColor, Filter, FnStage, FullscreenTriangle,
    IndexType, PassThroughVertex, SamplerState, Signature, Slot, TexturedFragment, Value,
    ValueType, VertexAttribute, VertexBinding, VertexInputRate,
};

use crate::harness::{HeadlessRenderer, PassClear};
use crate::mask::ErrorMask;
use crate::{Result, TestError};

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
const NEAR_DEPTH: f32 = 0.2;
const FAR_DEPTH: f32 = 0.8;
const NEAR_COLOR: Vec4 = Vec4::new(0.0, 1.0, 0.0, 1.0);
const FAR_COLOR: Vec4 = Vec4::new(1.0, 0.0, 0.0, 1.0);
const TEXTURE: [[u8; 4]; 4] = [
    [255, 0, 0, 255],
    [0, 255, 0, 255],
    [0, 0, 255, 255],
    [255, 255, 255, 255],
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Full-viewport triangle in constant red
    RedTriangle,
    /// Cleared image followed by a barrier-only command buffer
    BarrierOnly,
    /// Depth-tested triangles, near one drawn first
    DepthNearFirst,
    /// Depth-tested triangles, far one drawn first
    DepthFarFirst,
    /// Rectangle from two indexed triangles, blended additively
    SharedEdge,
    /// Two additive draws over a cleared single-channel target
    AdditiveR8,
    /// Interpolated texture coordinates written as color
    Gradient,
    /// 2x2 texture sampled with nearest filtering
    Textured,
}

impl Scenario {
    pub const ALL: [Self; 8] = [
        Self::RedTriangle,
        Self::BarrierOnly,
        Self::DepthNearFirst,
        Self::DepthFarFirst,
        Self::SharedEdge,
        Self::AdditiveR8,
        Self::Gradient,
        Self::Textured,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::RedTriangle => "red_triangle",
            Self::BarrierOnly => "barrier_only",
            Self::DepthNearFirst => "depth_near_first",
            Self::DepthFarFirst => "depth_far_first",
            Self::SharedEdge => "shared_edge",
            Self::AdditiveR8 => "additive_r8",
            Self::Gradient => "gradient",
            Self::Textured => "textured",
        }
    }

    /// Render the scenario into a `size` x `size` image.
    pub fn render(self, size: u32) -> Result<RgbaImage> {
        let span = tracing::debug_span!("scenario", name = self.name(), size);
        let _enter = span.enter();
        match self {
            Self::RedTriangle => render_red_triangle(size),
            Self::BarrierOnly => render_barrier_only(size),
            Self::DepthNearFirst => render_depth_pair(size, [NEAR_DEPTH, FAR_DEPTH]),
            Self::DepthFarFirst => render_depth_pair(size, [FAR_DEPTH, NEAR_DEPTH]),
            Self::SharedEdge => render_shared_edge(size),
            Self::AdditiveR8 => render_additive_r8(size),
            Self::Gradient => render_gradient(size),
            Self::Textured => render_textured(size),
        }
    }

    /// Expected image and its error mask.
    pub fn reference(self, size: u32) -> (RgbaImage, ErrorMask) {
        let exact = ErrorMask::exact(size, size);
        match self {
            Self::RedTriangle => (solid(size, [255, 0, 0, 255]), exact),
            Self::BarrierOnly => (solid(size, [0, 0, 255, 255]), exact),
            Self::DepthNearFirst | Self::DepthFarFirst => (solid(size, [0, 255, 0, 255]), exact),
            Self::SharedEdge => {
                let rect = shared_edge_rect(size);
                let image = ImageBuffer::from_fn(size, size, |x, y| {
                    if rect.contains(i64::from(x), i64::from(y)) {
                        Rgba([128, 128, 128, 128])
                    } else {
                        Rgba([0, 0, 0, 0])
                    }
                });
                (image, exact)
            }
            Self::AdditiveR8 => {
                let mut value = unorm8(0.25);
                for _ in 0..2 {
                    value = unorm8(f32::from(value) / 255.0 + 0.25);
                }
                (solid(size, [value, 0, 0, 255]), exact)
            }
            Self::Gradient => {
                let image = ImageBuffer::from_fn(size, size, |x, y| {
                    let uv = pixel_uv(size, x, y);
                    Rgba([unorm8(uv.x), unorm8(uv.y), 0, 255])
                });
                (image, ErrorMask::uniform(size, size, 1))
            }
            Self::Textured => {
                let image = ImageBuffer::from_fn(size, size, |x, y| {
                    let texel = (pixel_uv(size, x, y) * 2.0).floor();
                    Rgba(TEXTURE[(texel.y as usize) * 2 + texel.x as usize])
                });
                (image, exact)
            }
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = TestError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| TestError::UnknownScenario(s.to_string()))
    }
}

fn solid(size: u32, color: [u8; 4]) -> RgbaImage {
    ImageBuffer::from_pixel(size, size, Rgba(color))
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Texture coordinate the full-screen triangle produces at a pixel center.
fn pixel_uv(size: u32, x: u32, y: u32) -> Vec2 {
    (Vec2::new(x as f32, y as f32) + 0.5) / size as f32
}

fn fullscreen(depth: f32, color: Vec4) -> GraphicsPipelineConfig {
    GraphicsPipelineConfig {
        vertex_stage: Some(Arc::new(FullscreenTriangle::new(depth))),
        fragment_stage: Some(Arc::new(ConstantColor::new(color))),
        ..Default::default()
    }
}

fn render_red_triangle(size: u32) -> Result<RgbaImage> {
    let mut renderer = HeadlessRenderer::new(size, size)?;
    let pipeline = renderer.create_pipeline(fullscreen(0.5, Vec4::new(1.0, 0.0, 0.0, 1.0)), &[])?;
    renderer.render(&PassClear::color(BLACK), |device, cb| {
        device.cmd_bind_pipeline(cb, pipeline)?;
        device.cmd_draw(cb, 3, 1, 0, 0)
    })
}

fn render_barrier_only(size: u32) -> Result<RgbaImage> {
    let mut renderer = HeadlessRenderer::new(size, size)?;
    renderer.render_pass(&PassClear::color([0.0, 0.0, 1.0, 1.0]), |_, _| Ok(()))?;
    renderer.submit(|device, cb| {
        device.cmd_pipeline_barrier(
            cb,
            PipelineStageFlags::TOP_OF_PIPE,
            PipelineStageFlags::BOTTOM_OF_PIPE,
            &[MemoryBarrier::default()],
            &[],
            &[],
        )
    })?;
    renderer.capture()
}

fn render_depth_pair(size: u32, order: [f32; 2]) -> Result<RgbaImage> {
    let mut renderer = HeadlessRenderer::new(size, size)?;
    let pipelines = order
        .iter()
        .map(|&depth| {
            let color = if depth < 0.5 { NEAR_COLOR } else { FAR_COLOR };
            let config = GraphicsPipelineConfig {
                depth_test: true,
                depth_write: true,
                depth_compare_op: CompareOp::Less,
                depth_format: Some(HeadlessRenderer::DEPTH_FORMAT),
                ..fullscreen(depth, color)
            };
            renderer.create_pipeline(config, &[])
        })
        .collect::<Result<Vec<_>>>()?;

    renderer.render(&PassClear::color(BLACK).with_depth(1.0), |device, cb| {
        for &pipeline in &pipelines {
            device.cmd_bind_pipeline(cb, pipeline)?;
            device.cmd_draw(cb, 3, 1, 0, 0)?;
        }
        Ok(())
    })
}

/// Pixel rectangle covered by the shared-edge quad.
fn shared_edge_rect(size: u32) -> Rect2D {
    let inset = size / 8;
    Rect2D::new(inset as i32, inset as i32, size - 2 * inset, size - 2 * inset)
}

fn render_shared_edge(size: u32) -> Result<RgbaImage> {
    let mut renderer = HeadlessRenderer::new(size, size)?;
    let rect = shared_edge_rect(size);
    let ndc = |px: i64| 2.0 * px as f32 / size as f32 - 1.0;
    let (left, top) = (ndc(i64::from(rect.offset.x)), ndc(i64::from(rect.offset.y)));
    let (right, bottom) = (ndc(rect.right()), ndc(rect.bottom()));
    let vertices: [[f32; 4]; 4] = [
        [left, top, 0.0, 1.0],
        [right, top, 0.0, 1.0],
        [left, bottom, 0.0, 1.0],
        [right, bottom, 0.0, 1.0],
    ];
    // Both triangles share the 1-2 diagonal.
    let indices: [u16; 6] = [0, 1, 2, 2, 1, 3];
    let vertex_buffer =
        renderer.upload_buffer(bytemuck::cast_slice(&vertices), BufferUsageFlags::VERTEX_BUFFER)?;
    let index_buffer =
        renderer.upload_buffer(bytemuck::cast_slice(&indices), BufferUsageFlags::INDEX_BUFFER)?;

    let config = GraphicsPipelineConfig {
        vertex_stage: Some(Arc::new(PassThroughVertex::new(&[]))),
        fragment_stage: Some(Arc::new(ConstantColor::new(Vec4::splat(0.5)))),
        vertex_bindings: vec![VertexBinding {
            binding: 0,
            stride: 16,
            input_rate: VertexInputRate::Vertex,
        }],
        vertex_attributes: vec![VertexAttribute {
            location: 0,
            binding: 0,
            format: Format::R32G32B32A32Sfloat,
            offset: 0,
        }],
        color_blend: vec![ColorBlendAttachment::additive()],
        ..Default::default()
    };
    let pipeline = renderer.create_pipeline(config, &[])?;

    renderer.render(&PassClear::color([0.0; 4]), |device, cb| {
        device.cmd_bind_pipeline(cb, pipeline)?;
        device.cmd_bind_vertex_buffers(cb, 0, &[vertex_buffer], &[0])?;
        device.cmd_bind_index_buffer(cb, index_buffer, 0, IndexType::U16)?;
        device.cmd_draw_indexed(cb, 6, 1, 0, 0, 0)
    })
}

fn render_additive_r8(size: u32) -> Result<RgbaImage> {
    let mut renderer = HeadlessRenderer::with_format(size, size, Format::R8Unorm)?;
    let config = GraphicsPipelineConfig {
        color_blend: vec![ColorBlendAttachment::additive()],
        ..fullscreen(0.5, Vec4::new(0.25, 0.0, 0.0, 0.0))
    };
    let pipeline = renderer.create_pipeline(config, &[])?;
    renderer.render(&PassClear::color([0.25, 0.0, 0.0, 0.0]), |device, cb| {
        device.cmd_bind_pipeline(cb, pipeline)?;
        device.cmd_draw(cb, 3, 1, 0, 0)?;
        device.cmd_draw(cb, 3, 1, 0, 0)
    })
}

fn render_gradient(size: u32) -> Result<RgbaImage> {
    let mut renderer = HeadlessRenderer::new(size, size)?;
    let uv_to_color = FnStage::fragment(
        Signature::new(
            vec![Slot::location("uv", 0, ValueType::Vec2)],
            vec![Slot::location("color", 0, ValueType::Vec4)],
        ),
        |_, inputs, outputs| {
            let uv = inputs[0].as_vec4();
            outputs[0] = Value::Vec4(Vec4::new(uv.x, uv.y, 0.0, 1.0));
        },
    );
    let config = GraphicsPipelineConfig {
        fragment_stage: Some(Arc::new(uv_to_color)),
        ..fullscreen(0.5, Vec4::ZERO)
    };
    let pipeline = renderer.create_pipeline(config, &[])?;
    renderer.render(&PassClear::color(BLACK), |device, cb| {
        device.cmd_bind_pipeline(cb, pipeline)?;
        device.cmd_draw(cb, 3, 1, 0, 0)
    })
}

fn render_textured(size: u32) -> Result<RgbaImage> {
    let mut renderer = HeadlessRenderer::new(size, size)?;
    let texture = renderer.upload_texture(
        Format::R8G8B8A8Unorm,
        2,
        2,
        bytemuck::cast_slice(&TEXTURE),
    )?;

    let device = renderer.device();
    let sampler = device.create_sampler(SamplerState {
        mag_filter: Filter::Nearest,
        min_filter: Filter::Nearest,
        address_mode_u: AddressMode::ClampToEdge,
        address_mode_v: AddressMode::ClampToEdge,
        ..Default::default()
    })?;
    let layout = DescriptorSetLayoutBuilder::new()
        .sampled_image(0, ShaderStageFlags::FRAGMENT)
        .build(device)?;
    let pool = device.create_descriptor_pool(1)?;
    let set = device.allocate_descriptor_set(pool, layout)?;
    write_sampled_image(device, set, 0, texture, sampler)?;

    let config = GraphicsPipelineConfig {
        fragment_stage: Some(Arc::new(TexturedFragment::new(0, 0, 0))),
        ..fullscreen(0.5, Vec4::ZERO)
    };
    let pipeline = renderer.create_pipeline(config, &[layout])?;
    renderer.render(&PassClear::color(BLACK), |device, cb| {
        device.cmd_bind_pipeline(cb, pipeline)?;
        device.cmd_bind_descriptor_sets(cb, 0, &[set])?;
        device.cmd_draw(cb, 3, 1, 0, 0)
    })
}
