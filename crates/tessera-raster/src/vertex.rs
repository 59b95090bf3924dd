//! Vertex and index fetch.

use crate::draw::IndexInput;
use crate::error::{RasterError, Result};
use crate::pipeline::{GraphicsPipeline, VertexInputSource};
use crate::shader::Value;
use crate::state::VertexInputRate;

/// Read entry `i` of the index buffer.
pub(crate) fn fetch_index(input: &IndexInput<'_>, i: u32) -> Result<u32> {
    let size = input.index_type.size() as usize;
    let start = i as usize * size;
    let bytes = input.data.get(start..start + size).ok_or_else(|| {
        RasterError::IndexFetch(format!(
            "index {i} at byte {start} of a {}-byte buffer",
            input.data.len()
        ))
    })?;
    Ok(match size {
        2 => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
        _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    })
}

/// Build the vertex-stage inputs for one vertex.
pub(crate) fn fetch_vertex(
    pipeline: &GraphicsPipeline,
    buffers: &[Option<&[u8]>],
    vertex_index: u32,
    instance_index: u32,
    out: &mut Vec<Value>,
) -> Result<()> {
    let state = pipeline.state();
    let signature = state.vertex_stage.signature();
    out.clear();

    for (slot, source) in signature.inputs.iter().zip(&pipeline.linkage.vertex_inputs) {
        let value = match *source {
            VertexInputSource::VertexIndex => Value::Uint(vertex_index),
            VertexInputSource::InstanceIndex => Value::Uint(instance_index),
            VertexInputSource::Attribute(index) => {
                let attribute = &state.vertex_attributes[index];
                let binding = state
                    .vertex_bindings
                    .iter()
                    .find(|b| b.binding == attribute.binding)
                    .ok_or_else(|| {
                        RasterError::VertexFetch(format!("binding {} not declared", attribute.binding))
                    })?;
                let element = match binding.input_rate {
                    VertexInputRate::Vertex => vertex_index,
                    VertexInputRate::Instance => instance_index,
                };
                let data = buffers
                    .get(attribute.binding as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| {
                        RasterError::VertexFetch(format!(
                            "no vertex buffer bound at binding {}",
                            attribute.binding
                        ))
                    })?;

                let start = u64::from(element) * u64::from(binding.stride)
                    + u64::from(attribute.offset);
                let end = start + u64::from(attribute.format.texel_size());
                let bytes = usize::try_from(start)
                    .ok()
                    .zip(usize::try_from(end).ok())
                    .and_then(|(s, e)| data.get(s..e))
                    .ok_or_else(|| {
                        RasterError::VertexFetch(format!(
                            "location {} of element {element} reads bytes {start}..{end} of {}",
                            attribute.location,
                            data.len()
                        ))
                    })?;
                Value::from_texel(attribute.format.decode(bytes)?, slot.ty)
            }
        };
        out.push(value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IndexType;

    #[test]
    fn sixteen_bit_indices() {
        let data: Vec<u8> = [3u16, 65535, 7].iter().flat_map(|i| i.to_le_bytes()).collect();
        let input = IndexInput {
            data: &data,
            index_type: IndexType::U16,
        };
        assert_eq!(fetch_index(&input, 0).unwrap(), 3);
        assert_eq!(fetch_index(&input, 1).unwrap(), 65535);
        assert_eq!(fetch_index(&input, 2).unwrap(), 7);
        assert!(matches!(
            fetch_index(&input, 3),
            Err(RasterError::IndexFetch(_))
        ));
    }
}
