//! Pipeline state and stage linking.
//!
//! Linking resolves every stage slot against its producer once, at pipeline
//! creation, so draws only follow precomputed indices.

use crate::error::{RasterError, Result};
use crate::shader::{Builtin, Interpolation, ShaderStage, SlotBinding, StageKind, ValueType};
use crate::state::{
    ColorBlendAttachment, DepthStencilState, InputAssemblyState, RasterizationState,
    VertexAttribute, VertexBinding,
};
use std::sync::Arc;
use tessera_core::Format;

/// Everything a draw needs to know about the pipeline.
#[derive(Clone, Debug)]
pub struct PipelineState {
    pub vertex_stage: Arc<dyn ShaderStage>,
    pub fragment_stage: Arc<dyn ShaderStage>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    /// One entry per color attachment; missing entries default to no blending
    pub color_blend: Vec<ColorBlendAttachment>,
    pub color_formats: Vec<Format>,
    pub depth_stencil_format: Option<Format>,
}

/// Where a vertex-stage input comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VertexInputSource {
    /// Index into `vertex_attributes`
    Attribute(usize),
    VertexIndex,
    InstanceIndex,
}

/// A vertex output carried to the rasterizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Varying {
    pub location: u32,
    /// Index into the vertex stage outputs
    pub output: usize,
    pub flat: bool,
}

/// Where a fragment-stage input comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FragmentInputSource {
    /// Index into the linked varyings
    Varying(usize),
    FragCoord,
    FrontFacing,
}

/// Resolved slot wiring between stages and attachments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Linkage {
    pub vertex_inputs: Vec<VertexInputSource>,
    pub position: usize,
    pub point_size: Option<usize>,
    pub varyings: Vec<Varying>,
    pub fragment_inputs: Vec<FragmentInputSource>,
    /// `(fragment output index, color attachment index)`
    pub color_outputs: Vec<(usize, usize)>,
    pub frag_depth: Option<usize>,
}

/// A validated, linked pipeline.
#[derive(Clone, Debug)]
pub struct GraphicsPipeline {
    state: PipelineState,
    pub(crate) linkage: Linkage,
}

fn link_error(message: impl Into<String>) -> RasterError {
    RasterError::Link(message.into())
}

impl GraphicsPipeline {
    /// Validate the state and link the stages.
    pub fn link(mut state: PipelineState) -> Result<Self> {
        if state.vertex_stage.kind() != StageKind::Vertex {
            return Err(link_error("vertex slot holds a non-vertex stage"));
        }
        if state.fragment_stage.kind() != StageKind::Fragment {
            return Err(link_error("fragment slot holds a non-fragment stage"));
        }
        if state.color_blend.len() > state.color_formats.len() {
            return Err(link_error(format!(
                "{} blend states for {} color attachments",
                state.color_blend.len(),
                state.color_formats.len()
            )));
        }
        state
            .color_blend
            .resize(state.color_formats.len(), ColorBlendAttachment::default());

        if let Some(format) = state.color_formats.iter().find(|f| !f.is_color()) {
            return Err(link_error(format!("{format:?} is not a color format")));
        }
        if let Some(format) = state.depth_stencil_format {
            if format.is_color() {
                return Err(link_error(format!("{format:?} is not a depth/stencil format")));
            }
        }

        for attribute in &state.vertex_attributes {
            if !state
                .vertex_bindings
                .iter()
                .any(|b| b.binding == attribute.binding)
            {
                return Err(link_error(format!(
                    "attribute at location {} reads undeclared binding {}",
                    attribute.location, attribute.binding
                )));
            }
        }

        let vertex_inputs = link_vertex_inputs(&state)?;
        let (position, point_size, mut varyings) = link_vertex_outputs(&state)?;
        let fragment_inputs = link_fragment_inputs(&state, &mut varyings)?;
        let (color_outputs, frag_depth) = link_fragment_outputs(&state)?;

        tracing::trace!(
            varyings = varyings.len(),
            colors = color_outputs.len(),
            "Linked graphics pipeline"
        );

        Ok(Self {
            state,
            linkage: Linkage {
                vertex_inputs,
                position,
                point_size,
                varyings,
                fragment_inputs,
                color_outputs,
                frag_depth,
            },
        })
    }

    pub const fn state(&self) -> &PipelineState {
        &self.state
    }
}

fn link_vertex_inputs(state: &PipelineState) -> Result<Vec<VertexInputSource>> {
    let signature = state.vertex_stage.signature();
    signature
        .inputs
        .iter()
        .map(|slot| match slot.binding {
            SlotBinding::Location(location) => {
                let (index, attribute) = state
                    .vertex_attributes
                    .iter()
                    .enumerate()
                    .find(|(_, a)| a.location == location)
                    .ok_or_else(|| {
                        link_error(format!(
                            "vertex input '{}' at location {location} has no attribute",
                            slot.name
                        ))
                    })?;
                if attribute.format.class() != slot.ty.texel_class() || !attribute.format.is_color()
                {
                    return Err(link_error(format!(
                        "vertex input '{}' of type {:?} cannot read {:?}",
                        slot.name, slot.ty, attribute.format
                    )));
                }
                Ok(VertexInputSource::Attribute(index))
            }
            SlotBinding::Builtin(Builtin::VertexIndex) => Ok(VertexInputSource::VertexIndex),
            SlotBinding::Builtin(Builtin::InstanceIndex) => Ok(VertexInputSource::InstanceIndex),
            SlotBinding::Builtin(other) => Err(link_error(format!(
                "{other:?} is not a vertex stage input"
            ))),
        })
        .collect()
}

fn link_vertex_outputs(state: &PipelineState) -> Result<(usize, Option<usize>, Vec<Varying>)> {
    let signature = state.vertex_stage.signature();
    let mut position = None;
    let mut point_size = None;
    let mut varyings = Vec::new();

    for (index, slot) in signature.outputs.iter().enumerate() {
        match slot.binding {
            SlotBinding::Builtin(Builtin::Position) => position = Some(index),
            SlotBinding::Builtin(Builtin::PointSize) => point_size = Some(index),
            SlotBinding::Builtin(other) => {
                return Err(link_error(format!("{other:?} is not a vertex stage output")))
            }
            SlotBinding::Location(location) => {
                if varyings.iter().any(|v: &Varying| v.location == location) {
                    return Err(link_error(format!(
                        "vertex output location {location} declared twice"
                    )));
                }
                varyings.push(Varying {
                    location,
                    output: index,
                    flat: slot.interpolation == Interpolation::Flat || !slot.ty.is_float(),
                });
            }
        }
    }

    let position = position.ok_or_else(|| link_error("vertex stage does not write position"))?;
    if signature.outputs[position].ty != ValueType::Vec4 {
        return Err(link_error("position must be a Vec4"));
    }
    if let Some(index) = point_size {
        if signature.outputs[index].ty != ValueType::Float {
            return Err(link_error("point size must be a Float"));
        }
    }
    Ok((position, point_size, varyings))
}

fn link_fragment_inputs(
    state: &PipelineState,
    varyings: &mut [Varying],
) -> Result<Vec<FragmentInputSource>> {
    let vertex = state.vertex_stage.signature();
    let fragment = state.fragment_stage.signature();

    fragment
        .inputs
        .iter()
        .map(|slot| match slot.binding {
            SlotBinding::Location(location) => {
                let index = varyings
                    .iter()
                    .position(|v| v.location == location)
                    .ok_or_else(|| {
                        link_error(format!(
                            "fragment input '{}' at location {location} is not written by the vertex stage",
                            slot.name
                        ))
                    })?;
                let produced = &vertex.outputs[varyings[index].output];
                if produced.ty != slot.ty {
                    return Err(link_error(format!(
                        "fragment input '{}' is {:?} but the vertex stage writes {:?}",
                        slot.name, slot.ty, produced.ty
                    )));
                }
                if slot.interpolation == Interpolation::Flat {
                    varyings[index].flat = true;
                }
                Ok(FragmentInputSource::Varying(index))
            }
            SlotBinding::Builtin(Builtin::FragCoord) => Ok(FragmentInputSource::FragCoord),
            SlotBinding::Builtin(Builtin::FrontFacing) => Ok(FragmentInputSource::FrontFacing),
            SlotBinding::Builtin(other) => Err(link_error(format!(
                "{other:?} is not a fragment stage input"
            ))),
        })
        .collect()
}

fn link_fragment_outputs(state: &PipelineState) -> Result<(Vec<(usize, usize)>, Option<usize>)> {
    let signature = state.fragment_stage.signature();
    let mut colors = Vec::new();
    let mut frag_depth = None;

    for (index, slot) in signature.outputs.iter().enumerate() {
        match slot.binding {
            SlotBinding::Location(location) => {
                let attachment = location as usize;
                let format = state.color_formats.get(attachment).ok_or_else(|| {
                    link_error(format!(
                        "fragment output '{}' targets missing color attachment {location}",
                        slot.name
                    ))
                })?;
                if format.class() != slot.ty.texel_class() {
                    return Err(link_error(format!(
                        "fragment output '{}' of type {:?} cannot write {format:?}",
                        slot.name, slot.ty
                    )));
                }
                colors.push((index, attachment));
            }
            SlotBinding::Builtin(Builtin::FragDepth) => frag_depth = Some(index),
            SlotBinding::Builtin(other) => {
                return Err(link_error(format!("{other:?} is not a fragment stage output")))
            }
        }
    }
    Ok((colors, frag_depth))
}
