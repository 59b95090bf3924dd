//! Built-in shader stages.

use crate::shader::{
    Builtin, ShaderContext, ShaderStage, Signature, Slot, StageKind, Value, ValueType,
};
use glam::{Vec2, Vec4};
use std::fmt;

/// Forwards location 0 as the clip-space position and copies every other
/// declared attribute to the varying at the same location.
#[derive(Debug, Clone)]
pub struct PassThroughVertex {
    signature: Signature,
}

impl PassThroughVertex {
    /// `varyings` lists `(location, type)` pairs forwarded unchanged.
    pub fn new(varyings: &[(u32, ValueType)]) -> Self {
        let mut inputs = vec![Slot::location("position", 0, ValueType::Vec4)];
        let mut outputs = vec![Slot::builtin("position", Builtin::Position)];
        for &(location, ty) in varyings {
            let name = format!("attribute{location}");
            inputs.push(Slot::location(name.clone(), location, ty));
            outputs.push(Slot::location(name, location, ty));
        }
        Self {
            signature: Signature::new(inputs, outputs),
        }
    }
}

impl ShaderStage for PassThroughVertex {
    fn kind(&self) -> StageKind {
        StageKind::Vertex
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(&self, _ctx: &ShaderContext<'_>, inputs: &[Value], outputs: &mut [Value]) {
        outputs.copy_from_slice(inputs);
    }
}

/// Emits one triangle that covers the whole viewport, driven only by the
/// vertex index. Draw it with three vertices and no vertex buffers.
#[derive(Debug, Clone)]
pub struct FullscreenTriangle {
    depth: f32,
    signature: Signature,
}

impl FullscreenTriangle {
    pub fn new(depth: f32) -> Self {
        Self {
            depth,
            signature: Signature::new(
                vec![Slot::builtin("vertex_index", Builtin::VertexIndex)],
                vec![
                    Slot::builtin("position", Builtin::Position),
                    Slot::location("uv", 0, ValueType::Vec2),
                ],
            ),
        }
    }
}

impl ShaderStage for FullscreenTriangle {
    fn kind(&self) -> StageKind {
        StageKind::Vertex
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(&self, _ctx: &ShaderContext<'_>, inputs: &[Value], outputs: &mut [Value]) {
        let index = inputs[0].as_u32() % 3;
        let uv = Vec2::new(((index << 1) & 2) as f32, (index & 2) as f32);
        let xy = uv * 2.0 - Vec2::ONE;
        outputs[0] = Value::Vec4(Vec4::new(xy.x, xy.y, self.depth, 1.0));
        outputs[1] = Value::Vec2(uv);
    }
}

/// Writes one color to attachment 0.
#[derive(Debug, Clone)]
pub struct ConstantColor {
    color: Vec4,
    signature: Signature,
}

impl ConstantColor {
    pub fn new(color: Vec4) -> Self {
        Self {
            color,
            signature: Signature::new(vec![], vec![Slot::location("color", 0, ValueType::Vec4)]),
        }
    }
}

impl ShaderStage for ConstantColor {
    fn kind(&self) -> StageKind {
        StageKind::Fragment
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(&self, _ctx: &ShaderContext<'_>, _inputs: &[Value], outputs: &mut [Value]) {
        outputs[0] = Value::Vec4(self.color);
    }
}

/// Writes the interpolated `Vec4` varying at `location` to attachment 0.
#[derive(Debug, Clone)]
pub struct VaryingColor {
    signature: Signature,
}

impl VaryingColor {
    pub fn new(location: u32) -> Self {
        Self {
            signature: Signature::new(
                vec![Slot::location("color", location, ValueType::Vec4)],
                vec![Slot::location("color", 0, ValueType::Vec4)],
            ),
        }
    }

    /// Same as [`VaryingColor::new`] but reads the varying without interpolation.
    pub fn flat(location: u32) -> Self {
        Self {
            signature: Signature::new(
                vec![Slot::location("color", location, ValueType::Vec4).flat()],
                vec![Slot::location("color", 0, ValueType::Vec4)],
            ),
        }
    }
}

impl ShaderStage for VaryingColor {
    fn kind(&self) -> StageKind {
        StageKind::Fragment
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(&self, _ctx: &ShaderContext<'_>, inputs: &[Value], outputs: &mut [Value]) {
        outputs[0] = inputs[0];
    }
}

/// Samples the combined image sampler at `(set, binding)` with the `Vec2`
/// varying at `uv_location` and writes the result to attachment 0.
#[derive(Debug, Clone)]
pub struct TexturedFragment {
    set: u32,
    binding: u32,
    signature: Signature,
}

impl TexturedFragment {
    pub fn new(uv_location: u32, set: u32, binding: u32) -> Self {
        Self {
            set,
            binding,
            signature: Signature::new(
                vec![Slot::location("uv", uv_location, ValueType::Vec2)],
                vec![Slot::location("color", 0, ValueType::Vec4)],
            ),
        }
    }
}

impl ShaderStage for TexturedFragment {
    fn kind(&self) -> StageKind {
        StageKind::Fragment
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(&self, ctx: &ShaderContext<'_>, inputs: &[Value], outputs: &mut [Value]) {
        let Value::Vec2(uv) = inputs[0] else { return };
        if let Some(texel) = ctx.sample(self.set, self.binding, uv) {
            outputs[0] = Value::Vec4(texel.to_vec4());
        }
    }
}

type StageFn = dyn Fn(&ShaderContext<'_>, &[Value], &mut [Value]) + Send + Sync;

/// A stage backed by a closure.
pub struct FnStage {
    kind: StageKind,
    signature: Signature,
    func: Box<StageFn>,
}

impl FnStage {
    pub fn new<F>(kind: StageKind, signature: Signature, func: F) -> Self
    where
        F: Fn(&ShaderContext<'_>, &[Value], &mut [Value]) + Send + Sync + 'static,
    {
        Self {
            kind,
            signature,
            func: Box::new(func),
        }
    }

    pub fn vertex<F>(signature: Signature, func: F) -> Self
    where
        F: Fn(&ShaderContext<'_>, &[Value], &mut [Value]) + Send + Sync + 'static,
    {
        Self::new(StageKind::Vertex, signature, func)
    }

    pub fn fragment<F>(signature: Signature, func: F) -> Self
    where
        F: Fn(&ShaderContext<'_>, &[Value], &mut [Value]) + Send + Sync + 'static,
    {
        Self::new(StageKind::Fragment, signature, func)
    }
}

impl fmt::Debug for FnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("kind", &self.kind)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl ShaderStage for FnStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(&self, ctx: &ShaderContext<'_>, inputs: &[Value], outputs: &mut [Value]) {
        (self.func)(ctx, inputs, outputs);
    }
}
