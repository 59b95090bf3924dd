//! Pipeline creation and management.

use crate::capabilities::FormatFeatureFlags;
use crate::context::{Device, ObjectKey, ObjectKind};
use crate::descriptors::{DescriptorSetLayout, DescriptorSetLayoutHandle, ShaderStageFlags};
use crate::error::{DeviceError, Result};
use std::sync::Arc;
use tessera_core::{CompareOp, Format, Handle};
use tessera_raster::{
    ColorBlendAttachment, CullMode, DepthStencilState, FrontFace, GraphicsPipeline,
    InputAssemblyState, PipelineState, PolygonMode, PrimitiveTopology, RasterizationState,
    ShaderStage, StencilOpState, VertexAttribute, VertexBinding,
};

pub type PipelineHandle = Handle<Pipeline>;

/// Push constant bytes visible to a set of stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Graphics pipeline configuration.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineConfig {
    pub vertex_stage: Option<Arc<dyn ShaderStage>>,
    pub fragment_stage: Option<Arc<dyn ShaderStage>>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: PrimitiveTopology,
    pub primitive_restart: bool,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_clamp: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: CompareOp,
    pub stencil_test: bool,
    pub stencil_front: StencilOpState,
    pub stencil_back: StencilOpState,
    /// One entry per color attachment; missing entries disable blending
    pub color_blend: Vec<ColorBlendAttachment>,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_stage: None,
            fragment_stage: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: PrimitiveTopology::TriangleList,
            primitive_restart: false,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            depth_clamp: false,
            depth_test: false,
            depth_write: false,
            depth_compare_op: CompareOp::Less,
            stencil_test: false,
            stencil_front: StencilOpState::default(),
            stencil_back: StencilOpState::default(),
            color_blend: Vec::new(),
            color_formats: vec![Format::R8G8B8A8Unorm],
            depth_format: None,
        }
    }
}

impl GraphicsPipelineConfig {
    fn to_state(&self) -> Result<PipelineState> {
        let stage = |stage: &Option<Arc<dyn ShaderStage>>, name: &str| {
            stage
                .clone()
                .ok_or_else(|| DeviceError::PipelineCreation(format!("missing {name} stage")))
        };
        Ok(PipelineState {
            vertex_stage: stage(&self.vertex_stage, "vertex")?,
            fragment_stage: stage(&self.fragment_stage, "fragment")?,
            vertex_bindings: self.vertex_bindings.clone(),
            vertex_attributes: self.vertex_attributes.clone(),
            input_assembly: InputAssemblyState {
                topology: self.topology,
                primitive_restart: self.primitive_restart,
            },
            rasterization: RasterizationState {
                polygon_mode: self.polygon_mode,
                cull_mode: self.cull_mode,
                front_face: self.front_face,
                depth_clamp: self.depth_clamp,
            },
            depth_stencil: DepthStencilState {
                depth_test: self.depth_test,
                depth_write: self.depth_write,
                depth_compare_op: self.depth_compare_op,
                stencil_test: self.stencil_test,
                front: self.stencil_front,
                back: self.stencil_back,
            },
            color_blend: self.color_blend.clone(),
            color_formats: self.color_formats.clone(),
            depth_stencil_format: self.depth_format,
        })
    }
}

/// A linked graphics pipeline with its layout.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) linked: GraphicsPipeline,
    pub(crate) set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub(crate) push_constant_ranges: Vec<PushConstantRange>,
}

impl Pipeline {
    pub fn state(&self) -> &PipelineState {
        self.linked.state()
    }

    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }

    pub fn set_layout_count(&self) -> usize {
        self.set_layouts.len()
    }
}

impl Device {
    /// Validate the configuration and link the stages.
    pub fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[DescriptorSetLayoutHandle],
        push_constant_ranges: &[PushConstantRange],
    ) -> Result<PipelineHandle> {
        self.ctx.check_lost()?;
        let limits = &self.ctx.capabilities.limits;

        if descriptor_set_layouts.len() > limits.max_bound_descriptor_sets as usize {
            return Err(DeviceError::PipelineCreation(format!(
                "{} set layouts, at most {} allowed",
                descriptor_set_layouts.len(),
                limits.max_bound_descriptor_sets
            )));
        }
        let set_layouts = descriptor_set_layouts
            .iter()
            .map(|&layout| self.ctx.set_layouts.get(layout))
            .collect::<tessera_core::Result<Vec<_>>>()?;

        for range in push_constant_ranges {
            let end = range.offset.checked_add(range.size);
            if range.offset % 4 != 0
                || range.size % 4 != 0
                || range.size == 0
                || end.map_or(true, |end| end > limits.max_push_constants_size)
            {
                return Err(DeviceError::PipelineCreation(format!(
                    "push constant range {}+{} is not 4-byte aligned within {} bytes",
                    range.offset, range.size, limits.max_push_constants_size
                )));
            }
        }

        if config.color_formats.len() > limits.max_color_attachments as usize {
            return Err(DeviceError::PipelineCreation(format!(
                "{} color attachments, at most {} allowed",
                config.color_formats.len(),
                limits.max_color_attachments
            )));
        }
        if config.vertex_bindings.len() > limits.max_vertex_input_bindings as usize {
            return Err(DeviceError::PipelineCreation(format!(
                "{} vertex bindings, at most {} allowed",
                config.vertex_bindings.len(),
                limits.max_vertex_input_bindings
            )));
        }
        for (index, format) in config.color_formats.iter().enumerate() {
            let features = self.ctx.capabilities.format_features(*format);
            if !features.contains(FormatFeatureFlags::COLOR_ATTACHMENT) {
                return Err(DeviceError::PipelineCreation(format!(
                    "{format:?} cannot be color attachment {index}"
                )));
            }
            let blends = config.color_blend.get(index).is_some_and(|b| b.blend_enable);
            if blends && !features.contains(FormatFeatureFlags::COLOR_ATTACHMENT_BLEND) {
                tracing::warn!(?format, "Blending enabled on a format that cannot blend; it is skipped");
            }
        }

        let linked = GraphicsPipeline::link(config.to_state()?)?;
        let handle = self.ctx.pipelines.insert(Pipeline {
            linked,
            set_layouts,
            push_constant_ranges: push_constant_ranges.to_vec(),
        });
        tracing::debug!(
            ?handle,
            topology = ?config.topology,
            colors = config.color_formats.len(),
            "Created graphics pipeline"
        );
        Ok(handle)
    }

    pub fn destroy_pipeline(&self, pipeline: PipelineHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.pipelines.remove(pipeline)?;
        self.ctx
            .invalidate_references(ObjectKey::of(ObjectKind::Pipeline, pipeline));
        tracing::debug!(?pipeline, "Destroyed pipeline");
        Ok(())
    }
}
