//! Draw execution.
//!
//! One draw runs every stage to completion before returning. Within a draw,
//! primitives are processed in submission order and each primitive's
//! fragments in row-major order, so attachment results are deterministic.

use crate::assembly::{assemble, Primitive};
use crate::clip::{classify, clip_line, clip_polygon, Classification, ClipVertex};
use crate::error::{RasterError, Result};
use crate::line::rasterize_line;
use crate::output::{depth_stencil, write_color, Outcome};
use crate::pipeline::{FragmentInputSource, GraphicsPipeline};
use crate::point::rasterize_point;
use crate::resources::DescriptorBindings;
use crate::shader::{ShaderContext, Value};
use crate::state::{DynamicState, FrontFace, IndexType, PolygonMode};
use crate::surface::Surface;
use crate::triangle::{polygon_area, rasterize_triangle, Fragment, ScreenVertex, VaryingSetup};
use crate::vertex::{fetch_index, fetch_vertex};
use glam::{Vec2, Vec4};
use hashbrown::HashMap;
use tessera_core::constants::{MAX_VIEWPORT_DIMENSION, VIEWPORT_BOUNDS_RANGE};
use tessera_core::math::FixedPoint;
use tessera_core::{Rect2D, Viewport};

/// Parameters of a draw command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawCall {
    Direct {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Indexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

impl DrawCall {
    const fn instances(self) -> (u32, u32) {
        match self {
            Self::Direct {
                instance_count,
                first_instance,
                ..
            }
            | Self::Indexed {
                instance_count,
                first_instance,
                ..
            } => (first_instance, instance_count),
        }
    }
}

/// Index buffer bytes starting at the bound offset.
#[derive(Clone, Copy, Debug)]
pub struct IndexInput<'a> {
    pub data: &'a [u8],
    pub index_type: IndexType,
}

/// Resources a draw reads.
#[derive(Clone, Copy, Debug)]
pub struct DrawInputs<'a> {
    /// Vertex buffer bytes per binding slot, starting at the bound offset
    pub vertex_buffers: &'a [Option<&'a [u8]>],
    pub index_buffer: Option<IndexInput<'a>>,
    pub descriptors: &'a DescriptorBindings,
    pub push_constants: &'a [u8],
}

/// Attachments a draw renders into.
#[derive(Clone, Debug, PartialEq)]
pub struct Framebuffer {
    pub colors: Vec<Surface>,
    pub depth_stencil: Option<Surface>,
    pub render_area: Rect2D,
}

impl Framebuffer {
    /// Rectangle every attachment can be written in.
    fn bounds(&self) -> Rect2D {
        self.colors
            .iter()
            .chain(&self.depth_stencil)
            .fold(self.render_area, |rect, surface| {
                rect.intersect(surface.bounds())
            })
    }
}

/// Counters collected while drawing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub vertices_shaded: u64,
    pub primitives: u64,
    pub primitives_culled: u64,
    pub fragments_shaded: u64,
    pub fragments_written: u64,
}

impl DrawStats {
    pub fn accumulate(&mut self, other: &Self) {
        self.vertices_shaded += other.vertices_shaded;
        self.primitives += other.primitives;
        self.primitives_culled += other.primitives_culled;
        self.fragments_shaded += other.fragments_shaded;
        self.fragments_written += other.fragments_written;
    }
}

/// Execute one draw against `framebuffer`.
pub fn draw(
    pipeline: &GraphicsPipeline,
    dynamic: &DynamicState,
    inputs: &DrawInputs<'_>,
    call: DrawCall,
    framebuffer: &mut Framebuffer,
) -> Result<DrawStats> {
    check_attachments(pipeline, framebuffer)?;
    if !dynamic.viewport.fits(MAX_VIEWPORT_DIMENSION, VIEWPORT_BOUNDS_RANGE) {
        return Err(RasterError::Viewport(format!("{:?}", dynamic.viewport)));
    }

    let bounds = framebuffer.bounds().intersect(dynamic.scissor);
    let ctx = ShaderContext::new(inputs.push_constants, inputs.descriptors);
    let mut stats = DrawStats::default();
    if bounds.is_empty() {
        return Ok(stats);
    }

    let mut drawer = Drawer {
        pipeline,
        dynamic,
        ctx,
        bounds,
        flat: pipeline.linkage.varyings.iter().map(|v| v.flat).collect(),
        framebuffer,
        stats: &mut stats,
    };

    let (first_instance, instance_count) = call.instances();
    for instance in first_instance..first_instance.saturating_add(instance_count) {
        let (shaded, stream) = drawer.shade_vertices(inputs, call, instance)?;
        let topology = pipeline.state().input_assembly.topology;
        for primitive in assemble(topology, &stream) {
            drawer.stats.primitives += 1;
            match primitive {
                Primitive::Triangle([a, b, c]) => {
                    drawer.triangle([&shaded[a], &shaded[b], &shaded[c]])?;
                }
                Primitive::Line([a, b]) => drawer.line(&shaded[a], &shaded[b])?,
                Primitive::Point(a) => drawer.point(&shaded[a])?,
            }
        }
    }

    tracing::trace!(
        vertices = stats.vertices_shaded,
        primitives = stats.primitives,
        fragments = stats.fragments_written,
        "Draw complete"
    );
    Ok(stats)
}

fn check_attachments(pipeline: &GraphicsPipeline, framebuffer: &Framebuffer) -> Result<()> {
    let state = pipeline.state();
    if framebuffer.colors.len() != state.color_formats.len() {
        return Err(RasterError::Attachment(format!(
            "pipeline writes {} color attachments, {} bound",
            state.color_formats.len(),
            framebuffer.colors.len()
        )));
    }
    for (i, (surface, &format)) in framebuffer.colors.iter().zip(&state.color_formats).enumerate() {
        if surface.format() != format {
            return Err(RasterError::Attachment(format!(
                "color attachment {i} is {:?}, pipeline expects {format:?}",
                surface.format()
            )));
        }
    }
    match (&framebuffer.depth_stencil, state.depth_stencil_format) {
        (Some(surface), Some(format)) if surface.format() != format => {
            Err(RasterError::Attachment(format!(
                "depth/stencil attachment is {:?}, pipeline expects {format:?}",
                surface.format()
            )))
        }
        (None, Some(format)) => Err(RasterError::Attachment(format!(
            "pipeline expects a {format:?} depth/stencil attachment"
        ))),
        _ => Ok(()),
    }
}

#[derive(Clone, Copy)]
enum VertexSource<'a> {
    Direct {
        first_vertex: u32,
    },
    Indexed {
        buffer: IndexInput<'a>,
        first_index: u32,
        vertex_offset: i32,
    },
}

struct Drawer<'a> {
    pipeline: &'a GraphicsPipeline,
    dynamic: &'a DynamicState,
    ctx: ShaderContext<'a>,
    bounds: Rect2D,
    flat: Vec<bool>,
    framebuffer: &'a mut Framebuffer,
    stats: &'a mut DrawStats,
}

impl Drawer<'_> {
    /// Run the vertex stage over the draw's vertex stream for one instance.
    /// Each distinct vertex index is shaded once.
    fn shade_vertices(
        &mut self,
        inputs: &DrawInputs<'_>,
        call: DrawCall,
        instance: u32,
    ) -> Result<(Vec<ClipVertex>, Vec<Option<usize>>)> {
        let mut cache: HashMap<u32, usize> = HashMap::new();
        let mut shaded = Vec::new();
        let mut stream = Vec::new();
        let mut scratch = Vec::new();
        let pipeline = self.pipeline;
        let state = pipeline.state();

        let (count, source) = match call {
            DrawCall::Direct {
                vertex_count,
                first_vertex,
                ..
            } => (vertex_count, VertexSource::Direct { first_vertex }),
            DrawCall::Indexed {
                index_count,
                first_index,
                vertex_offset,
                ..
            } => {
                let buffer = inputs.index_buffer.ok_or_else(|| {
                    RasterError::IndexFetch("indexed draw without an index buffer".into())
                })?;
                (
                    index_count,
                    VertexSource::Indexed {
                        buffer,
                        first_index,
                        vertex_offset,
                    },
                )
            }
        };

        for i in 0..count {
            let vertex_index = match source {
                VertexSource::Direct { first_vertex } => first_vertex.wrapping_add(i),
                VertexSource::Indexed {
                    buffer,
                    first_index,
                    vertex_offset,
                } => {
                    let raw = fetch_index(&buffer, first_index.wrapping_add(i))?;
                    if state.input_assembly.primitive_restart
                        && raw == buffer.index_type.restart_value()
                    {
                        stream.push(None);
                        continue;
                    }
                    u32::try_from(i64::from(raw) + i64::from(vertex_offset)).map_err(|_| {
                        RasterError::IndexFetch(format!(
                            "index {raw} with vertex offset {vertex_offset} is negative"
                        ))
                    })?
                }
            };

            if let Some(&slot) = cache.get(&vertex_index) {
                stream.push(Some(slot));
                continue;
            }

            fetch_vertex(pipeline, inputs.vertex_buffers, vertex_index, instance, &mut scratch)?;
            let mut outputs = state.vertex_stage.signature().zeroed_outputs();
            state.vertex_stage.invoke(&self.ctx, &scratch, &mut outputs);
            self.stats.vertices_shaded += 1;

            let linkage = &pipeline.linkage;
            shaded.push(ClipVertex {
                position: outputs[linkage.position].as_vec4(),
                point_size: linkage.point_size.map_or(1.0, |i| outputs[i].as_f32()),
                varyings: linkage.varyings.iter().map(|v| outputs[v.output]).collect(),
            });
            cache.insert(vertex_index, shaded.len() - 1);
            stream.push(Some(shaded.len() - 1));
        }
        Ok((shaded, stream))
    }

    fn depth_clamp(&self) -> bool {
        self.pipeline.state().rasterization.depth_clamp
    }

    fn to_screen(&self, v: &ClipVertex) -> ScreenVertex {
        let vp: &Viewport = &self.dynamic.viewport;
        let inv_w = 1.0 / v.position.w;
        let ndc = v.position.truncate() * inv_w;
        let x = vp.x + (ndc.x + 1.0) * 0.5 * vp.width;
        let y = vp.y + (ndc.y + 1.0) * 0.5 * vp.height;
        let mut z = vp.min_depth + ndc.z * (vp.max_depth - vp.min_depth);
        if self.depth_clamp() {
            z = z.clamp(vp.min_depth.min(vp.max_depth), vp.min_depth.max(vp.max_depth));
        }
        ScreenVertex {
            fixed: FixedPoint::snap(x, y),
            position: Vec2::new(x, y),
            z,
            inv_w,
            point_size: v.point_size,
            varyings: v.varyings.clone(),
        }
    }

    fn triangle(&mut self, vertices: [&ClipVertex; 3]) -> Result<()> {
        let positions: [Vec4; 3] = vertices.map(|v| v.position);
        let polygon = match classify(&positions, self.depth_clamp()) {
            Classification::Outside => {
                self.stats.primitives_culled += 1;
                return Ok(());
            }
            Classification::Inside => vertices.iter().map(|&v| v.clone()).collect(),
            Classification::Straddling => clip_polygon(
                vertices.iter().map(|&v| v.clone()).collect(),
                self.depth_clamp(),
            ),
        };
        if polygon.len() < 3 || polygon.iter().any(|v| v.position.w <= 0.0) {
            self.stats.primitives_culled += 1;
            return Ok(());
        }

        let screen: Vec<ScreenVertex> = polygon.iter().map(|v| self.to_screen(v)).collect();
        let area = polygon_area(&screen);
        if area == 0 {
            self.stats.primitives_culled += 1;
            return Ok(());
        }
        let rasterization = self.pipeline.state().rasterization;
        let front_facing = (area > 0) == (rasterization.front_face == FrontFace::Clockwise);
        if rasterization.cull_mode.culls(front_facing) {
            self.stats.primitives_culled += 1;
            return Ok(());
        }

        let provoking = vertices[0].varyings.clone();
        let flat = std::mem::take(&mut self.flat);
        let setup = VaryingSetup {
            flat: &flat,
            provoking: &provoking,
        };
        let bounds = self.bounds;
        let result = match rasterization.polygon_mode {
            PolygonMode::Fill => screen.windows(2).skip(1).try_for_each(|pair| {
                rasterize_triangle(
                    [&screen[0], &pair[0], &pair[1]],
                    bounds,
                    front_facing,
                    setup,
                    &mut |f: &Fragment| self.shade_fragment(f),
                )
                .map(drop)
            }),
            PolygonMode::Line => (0..screen.len()).try_for_each(|i| {
                let next = &screen[(i + 1) % screen.len()];
                rasterize_line(&screen[i], next, bounds, setup, &mut |f: &Fragment| {
                    self.shade_fragment(&Fragment {
                        front_facing,
                        ..f.clone()
                    })
                })
                .map(drop)
            }),
            PolygonMode::Point => screen.iter().try_for_each(|v| {
                rasterize_point(v, bounds, setup, &mut |f: &Fragment| {
                    self.shade_fragment(&Fragment {
                        front_facing,
                        ..f.clone()
                    })
                })
                .map(drop)
            }),
        };
        self.flat = flat;
        result
    }

    fn line(&mut self, a: &ClipVertex, b: &ClipVertex) -> Result<()> {
        let Some((a_clipped, b_clipped)) = clip_line(a, b, self.depth_clamp()) else {
            self.stats.primitives_culled += 1;
            return Ok(());
        };
        if a_clipped.position.w <= 0.0 || b_clipped.position.w <= 0.0 {
            self.stats.primitives_culled += 1;
            return Ok(());
        }
        let sa = self.to_screen(&a_clipped);
        let sb = self.to_screen(&b_clipped);

        let flat = std::mem::take(&mut self.flat);
        let setup = VaryingSetup {
            flat: &flat,
            provoking: &a.varyings,
        };
        let bounds = self.bounds;
        let result = rasterize_line(&sa, &sb, bounds, setup, &mut |f: &Fragment| {
            self.shade_fragment(f)
        })
        .map(drop);
        self.flat = flat;
        result
    }

    fn point(&mut self, v: &ClipVertex) -> Result<()> {
        if !matches!(
            classify(&[v.position], self.depth_clamp()),
            Classification::Inside
        ) || v.position.w <= 0.0
        {
            self.stats.primitives_culled += 1;
            return Ok(());
        }
        let screen = self.to_screen(v);

        let flat = std::mem::take(&mut self.flat);
        let setup = VaryingSetup {
            flat: &flat,
            provoking: &v.varyings,
        };
        let bounds = self.bounds;
        let result = rasterize_point(&screen, bounds, setup, &mut |f: &Fragment| {
            self.shade_fragment(f)
        })
        .map(drop);
        self.flat = flat;
        result
    }

    /// Run the fragment stage, then the depth/stencil tests and color writes.
    fn shade_fragment(&mut self, fragment: &Fragment) -> Result<()> {
        let pipeline = self.pipeline;
        let state = pipeline.state();
        let linkage = &pipeline.linkage;

        let inputs: Vec<Value> = linkage
            .fragment_inputs
            .iter()
            .map(|source| match *source {
                FragmentInputSource::Varying(i) => fragment.varyings[i],
                FragmentInputSource::FragCoord => Value::Vec4(Vec4::new(
                    fragment.x as f32 + 0.5,
                    fragment.y as f32 + 0.5,
                    fragment.depth,
                    fragment.inv_w,
                )),
                FragmentInputSource::FrontFacing => Value::Uint(u32::from(fragment.front_facing)),
            })
            .collect();
        let mut outputs = state.fragment_stage.signature().zeroed_outputs();
        state.fragment_stage.invoke(&self.ctx, &inputs, &mut outputs);
        self.stats.fragments_shaded += 1;

        let depth = linkage
            .frag_depth
            .map_or(fragment.depth, |i| outputs[i].as_f32());
        let outcome = depth_stencil(
            state,
            self.dynamic,
            self.framebuffer.depth_stencil.as_mut(),
            fragment.x,
            fragment.y,
            depth,
            fragment.front_facing,
        )?;
        if outcome != Outcome::Written {
            return Ok(());
        }

        for &(output, attachment) in &linkage.color_outputs {
            write_color(
                &mut self.framebuffer.colors[attachment],
                &state.color_blend[attachment],
                self.dynamic.blend_constants,
                fragment.x,
                fragment.y,
                outputs[output].to_texel(),
            )?;
        }
        self.stats.fragments_written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineState;
    use crate::shader::{Builtin, Signature, Slot, ShaderStage, StageKind, ValueType};
    use crate::stages::{ConstantColor, FnStage, FullscreenTriangle, PassThroughVertex, VaryingColor};
    use crate::state::{
        ColorBlendAttachment, CullMode, DepthStencilState, InputAssemblyState, PrimitiveTopology,
        RasterizationState, VertexAttribute, VertexBinding, VertexInputRate,
    };
    use std::sync::Arc;
    use tessera_core::{CompareOp, Extent2D, Format};

    const SIZE: u32 = 16;

    fn position_pipeline(
        fragment: Arc<dyn ShaderStage>,
        format: Format,
        blend: ColorBlendAttachment,
    ) -> PipelineState {
        PipelineState {
            vertex_stage: Arc::new(PassThroughVertex::new(&[])),
            fragment_stage: fragment,
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
            input_assembly: InputAssemblyState::default(),
            rasterization: RasterizationState::default(),
            depth_stencil: DepthStencilState::default(),
            color_blend: vec![blend],
            color_formats: vec![format],
            depth_stencil_format: None,
        }
    }

    fn framebuffer(format: Format) -> Framebuffer {
        let extent = Extent2D::new(SIZE, SIZE);
        Framebuffer {
            colors: vec![Surface::new(format, extent)],
            depth_stencil: None,
            render_area: Rect2D::from_extent(extent),
        }
    }

    fn vertex_bytes(positions: &[[f32; 4]]) -> Vec<u8> {
        bytemuck::cast_slice(positions).to_vec()
    }

    fn run(
        pipeline: &GraphicsPipeline,
        vertices: &[u8],
        call: DrawCall,
        fb: &mut Framebuffer,
    ) -> DrawStats {
        let descriptors = DescriptorBindings::default();
        let buffers = [Some(vertices)];
        let inputs = DrawInputs {
            vertex_buffers: &buffers,
            index_buffer: None,
            descriptors: &descriptors,
            push_constants: &[],
        };
        let dynamic = DynamicState::covering(fb.render_area);
        draw(pipeline, &dynamic, &inputs, call, fb).unwrap()
    }

    fn direct(vertex_count: u32) -> DrawCall {
        DrawCall::Direct {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }

    #[test]
    fn fullscreen_triangle_fills_every_pixel() {
        let mut state = position_pipeline(
            Arc::new(ConstantColor::new(Vec4::new(1.0, 0.0, 0.0, 1.0))),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        );
        state.vertex_stage = Arc::new(FullscreenTriangle::new(0.5));
        state.vertex_bindings.clear();
        state.vertex_attributes.clear();
        let pipeline = GraphicsPipeline::link(state).unwrap();

        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let stats = run(&pipeline, &[], direct(3), &mut fb);

        assert_eq!(stats.fragments_written, u64::from(SIZE * SIZE));
        assert!(fb.colors[0]
            .as_bytes()
            .chunks_exact(4)
            .all(|px| px == [255, 0, 0, 255]));
    }

    #[test]
    fn shared_edge_quad_is_covered_exactly_once() {
        let pipeline = GraphicsPipeline::link(position_pipeline(
            Arc::new(ConstantColor::new(Vec4::splat(0.25))),
            Format::R8Unorm,
            ColorBlendAttachment::additive(),
        ))
        .unwrap();
        // Two triangles forming a quad with an off-axis diagonal.
        let vertices = vertex_bytes(&[
            [-0.8, -0.7, 0.5, 1.0],
            [0.9, -0.6, 0.5, 1.0],
            [0.7, 0.85, 0.5, 1.0],
            [-0.8, -0.7, 0.5, 1.0],
            [0.7, 0.85, 0.5, 1.0],
            [-0.6, 0.9, 0.5, 1.0],
        ]);
        let mut fb = framebuffer(Format::R8Unorm);
        run(&pipeline, &vertices, direct(6), &mut fb);

        let bytes = fb.colors[0].as_bytes();
        assert!(bytes.iter().all(|&b| b == 0 || b == 64), "double coverage found");
        assert!(bytes.iter().filter(|&&b| b == 64).count() > 100);
    }

    #[test]
    fn depth_test_keeps_the_nearest_in_either_order() {
        let near = [[-1.0, -1.0, 0.2, 1.0], [3.0, -1.0, 0.2, 1.0], [-1.0, 3.0, 0.2, 1.0]];
        let far = [[-1.0, -1.0, 0.8, 1.0], [3.0, -1.0, 0.8, 1.0], [-1.0, 3.0, 0.8, 1.0]];

        for order in [[near, far], [far, near]] {
            let mut state = position_pipeline(
                Arc::new(VaryingColor::new(1)),
                Format::R8G8B8A8Unorm,
                ColorBlendAttachment::default(),
            );
            state.vertex_stage = Arc::new(PassThroughVertex::new(&[(1, ValueType::Vec4)]));
            state.vertex_bindings[0].stride = 32;
            state.vertex_attributes.push(VertexAttribute {
                location: 1,
                binding: 0,
                format: Format::R32G32B32A32Sfloat,
                offset: 16,
            });
            state.depth_stencil = DepthStencilState {
                depth_test: true,
                depth_write: true,
                depth_compare_op: CompareOp::Less,
                ..Default::default()
            };
            state.depth_stencil_format = Some(Format::D32Sfloat);
            let pipeline = GraphicsPipeline::link(state).unwrap();

            let mut data = Vec::new();
            for tri in &order {
                // Near is green, far is red.
                let color: [f32; 4] = if tri[0][2] < 0.5 {
                    [0.0, 1.0, 0.0, 1.0]
                } else {
                    [1.0, 0.0, 0.0, 1.0]
                };
                for position in tri {
                    data.extend_from_slice(bytemuck::cast_slice(position));
                    data.extend_from_slice(bytemuck::cast_slice(&color));
                }
            }

            let mut fb = framebuffer(Format::R8G8B8A8Unorm);
            let mut depth = Surface::new(Format::D32Sfloat, Extent2D::new(SIZE, SIZE));
            depth
                .clear_depth_stencil(fb.render_area, Some(1.0), None)
                .unwrap();
            fb.depth_stencil = Some(depth);
            run(&pipeline, &data, direct(6), &mut fb);

            assert!(fb.colors[0]
                .as_bytes()
                .chunks_exact(4)
                .all(|px| px == [0, 255, 0, 255]));
            let stored = fb.depth_stencil.as_ref().unwrap().read_depth(3, 3).unwrap();
            assert!((stored - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn back_faces_are_culled() {
        let mut state = position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        );
        state.rasterization.cull_mode = CullMode::Back;
        state.rasterization.front_face = FrontFace::Clockwise;
        let pipeline = GraphicsPipeline::link(state).unwrap();

        // Clockwise on screen (y down): top-left, top-right, bottom-left.
        let clockwise = vertex_bytes(&[
            [-1.0, -1.0, 0.5, 1.0],
            [1.0, -1.0, 0.5, 1.0],
            [-1.0, 1.0, 0.5, 1.0],
        ]);
        let counter = vertex_bytes(&[
            [-1.0, -1.0, 0.5, 1.0],
            [-1.0, 1.0, 0.5, 1.0],
            [1.0, -1.0, 0.5, 1.0],
        ]);

        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let stats = run(&pipeline, &clockwise, direct(3), &mut fb);
        assert_eq!(stats.primitives_culled, 0);
        assert!(stats.fragments_written > 0);

        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let stats = run(&pipeline, &counter, direct(3), &mut fb);
        assert_eq!(stats.primitives_culled, 1);
        assert_eq!(stats.fragments_written, 0);
    }

    #[test]
    fn clipped_triangle_stays_inside_the_framebuffer() {
        let pipeline = GraphicsPipeline::link(position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        ))
        .unwrap();
        let vertices = vertex_bytes(&[
            [-4.0, -4.0, 0.5, 1.0],
            [4.0, -4.0, 0.5, 1.0],
            [0.0, 4.0, -0.5, 1.0],
        ]);
        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let stats = run(&pipeline, &vertices, direct(3), &mut fb);
        assert_eq!(stats.primitives_culled, 0);
        assert!(stats.fragments_written > 0);
        assert!(stats.fragments_written <= u64::from(SIZE * SIZE));
    }

    #[test]
    fn vertex_cache_shades_each_index_once() {
        let pipeline = GraphicsPipeline::link(position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        ))
        .unwrap();
        let vertices = vertex_bytes(&[
            [-1.0, -1.0, 0.5, 1.0],
            [1.0, -1.0, 0.5, 1.0],
            [1.0, 1.0, 0.5, 1.0],
            [-1.0, 1.0, 0.5, 1.0],
        ]);
        let indices: Vec<u8> = [0u16, 1, 2, 0, 2, 3]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect();

        let descriptors = DescriptorBindings::default();
        let buffers = [Some(vertices.as_slice())];
        let inputs = DrawInputs {
            vertex_buffers: &buffers,
            index_buffer: Some(IndexInput {
                data: &indices,
                index_type: IndexType::U16,
            }),
            descriptors: &descriptors,
            push_constants: &[],
        };
        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let dynamic = DynamicState::covering(fb.render_area);
        let stats = draw(
            &pipeline,
            &dynamic,
            &inputs,
            DrawCall::Indexed {
                index_count: 6,
                instance_count: 1,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            },
            &mut fb,
        )
        .unwrap();

        assert_eq!(stats.vertices_shaded, 4);
        assert_eq!(stats.fragments_written, u64::from(SIZE * SIZE));
    }

    #[test]
    fn scissor_limits_writes() {
        let pipeline = GraphicsPipeline::link(position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        ))
        .unwrap();
        let vertices = vertex_bytes(&[
            [-1.0, -1.0, 0.5, 1.0],
            [3.0, -1.0, 0.5, 1.0],
            [-1.0, 3.0, 0.5, 1.0],
        ]);
        let descriptors = DescriptorBindings::default();
        let buffers = [Some(vertices.as_slice())];
        let inputs = DrawInputs {
            vertex_buffers: &buffers,
            index_buffer: None,
            descriptors: &descriptors,
            push_constants: &[],
        };
        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let mut dynamic = DynamicState::covering(fb.render_area);
        dynamic.scissor = Rect2D::new(4, 4, 2, 3);

        let stats = draw(&pipeline, &dynamic, &inputs, direct(3), &mut fb).unwrap();
        assert_eq!(stats.fragments_written, 6);
        assert_eq!(fb.colors[0].read(5, 6).unwrap().to_vec4(), Vec4::ONE);
        assert_eq!(fb.colors[0].read(6, 6).unwrap().to_vec4(), Vec4::ZERO);
    }

    #[test]
    fn mismatched_attachment_is_rejected() {
        let pipeline = GraphicsPipeline::link(position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        ))
        .unwrap();
        let descriptors = DescriptorBindings::default();
        let inputs = DrawInputs {
            vertex_buffers: &[],
            index_buffer: None,
            descriptors: &descriptors,
            push_constants: &[],
        };
        let mut fb = framebuffer(Format::R8Unorm);
        let dynamic = DynamicState::covering(fb.render_area);
        let err = draw(&pipeline, &dynamic, &inputs, direct(3), &mut fb).unwrap_err();
        assert!(matches!(err, RasterError::Attachment(_)));
    }

    #[test]
    fn oversized_viewport_fails_the_draw() {
        let pipeline = GraphicsPipeline::link(position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        ))
        .unwrap();
        let vertices = vertex_bytes(&[
            [-1.0, -1.0, 0.5, 1.0],
            [3.0, -1.0, 0.5, 1.0],
            [-1.0, 3.0, 0.5, 1.0],
        ]);
        let descriptors = DescriptorBindings::default();
        let buffers = [Some(vertices.as_slice())];
        let inputs = DrawInputs {
            vertex_buffers: &buffers,
            index_buffer: None,
            descriptors: &descriptors,
            push_constants: &[],
        };
        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let mut dynamic = DynamicState::covering(fb.render_area);
        dynamic.viewport.x = -5e7;
        dynamic.viewport.y = -5e7;
        dynamic.viewport.width = 1e8;
        dynamic.viewport.height = 1e8;

        let err = draw(&pipeline, &dynamic, &inputs, direct(3), &mut fb).unwrap_err();
        assert!(matches!(err, RasterError::Viewport(_)));
        assert!(fb.colors[0].as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn line_strip_and_points() {
        let mut state = position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        );
        state.input_assembly.topology = PrimitiveTopology::LineStrip;
        let lines = GraphicsPipeline::link(state.clone()).unwrap();
        state.input_assembly.topology = PrimitiveTopology::PointList;
        let points = GraphicsPipeline::link(state).unwrap();

        // Pixel centers (0.5, 0.5), (8.5, 0.5), (8.5, 8.5) in a 16x16 target.
        let to_ndc = |p: f32| p / 8.0 - 1.0;
        let vertices = vertex_bytes(&[
            [to_ndc(0.5), to_ndc(0.5), 0.5, 1.0],
            [to_ndc(8.5), to_ndc(0.5), 0.5, 1.0],
            [to_ndc(8.5), to_ndc(8.5), 0.5, 1.0],
        ]);

        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let stats = run(&lines, &vertices, direct(3), &mut fb);
        assert_eq!(stats.primitives, 2);
        assert_eq!(stats.fragments_written, 16);

        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let stats = run(&points, &vertices, direct(3), &mut fb);
        assert_eq!(stats.fragments_written, 3);
        assert_eq!(fb.colors[0].read(8, 8).unwrap().to_vec4(), Vec4::ONE);
    }

    #[test]
    fn instance_index_reaches_the_vertex_stage() {
        let vertex = FnStage::new(
            StageKind::Vertex,
            Signature::new(
                vec![
                    Slot::builtin("vertex_index", Builtin::VertexIndex),
                    Slot::builtin("instance_index", Builtin::InstanceIndex),
                ],
                vec![Slot::builtin("position", Builtin::Position)],
            ),
            |_, inputs, outputs| {
                // One point per instance along the top row.
                let x = inputs[1].as_u32() as f32 / 8.0 - 1.0 + 1.0 / 16.0;
                outputs[0] = Value::Vec4(Vec4::new(x, -1.0 + 1.0 / 16.0, 0.5, 1.0));
            },
        );
        let mut state = position_pipeline(
            Arc::new(ConstantColor::new(Vec4::ONE)),
            Format::R8G8B8A8Unorm,
            ColorBlendAttachment::default(),
        );
        state.vertex_stage = Arc::new(vertex);
        state.vertex_bindings.clear();
        state.vertex_attributes.clear();
        state.input_assembly.topology = PrimitiveTopology::PointList;
        let pipeline = GraphicsPipeline::link(state).unwrap();

        let mut fb = framebuffer(Format::R8G8B8A8Unorm);
        let stats = run(
            &pipeline,
            &[],
            DrawCall::Direct {
                vertex_count: 1,
                instance_count: 4,
                first_vertex: 0,
                first_instance: 0,
            },
            &mut fb,
        );
        assert_eq!(stats.fragments_written, 4);
        for x in 0..4 {
            assert_eq!(fb.colors[0].read(x, 0).unwrap().to_vec4(), Vec4::ONE);
        }
    }
}
