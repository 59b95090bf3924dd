//! Shader stage interface.
//!
//! A stage is an opaque callable with a declared [`Signature`]: an ordered
//! list of named inputs and an ordered list of named outputs. The pipeline
//! hands inputs in signature order and reads outputs back in signature
//! order. Stages have no side effects outside their outputs.

use crate::resources::DescriptorBindings;
use crate::sampler::SamplerState;
use bytemuck::Pod;
use glam::{IVec4, UVec4, Vec2, Vec3, Vec4};
use std::fmt;
use tessera_core::Texel;

/// Type of a shader input or output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Uint,
    Int,
    UVec4,
    IVec4,
}

impl ValueType {
    /// Whether values of this type are made of floats.
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Vec2 | Self::Vec3 | Self::Vec4)
    }

    /// Texel class this type reads from or writes to.
    pub const fn texel_class(self) -> tessera_core::format::TexelClass {
        use tessera_core::format::TexelClass;
        match self {
            Self::Float | Self::Vec2 | Self::Vec3 | Self::Vec4 => TexelClass::Float,
            Self::Uint | Self::UVec4 => TexelClass::Uint,
            Self::Int | Self::IVec4 => TexelClass::Sint,
        }
    }
}

/// A shader value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Uint(u32),
    Int(i32),
    UVec4(UVec4),
    IVec4(IVec4),
}

impl Value {
    /// Zero of the given type.
    pub const fn zero(ty: ValueType) -> Self {
        match ty {
            ValueType::Float => Self::Float(0.0),
            ValueType::Vec2 => Self::Vec2(Vec2::ZERO),
            ValueType::Vec3 => Self::Vec3(Vec3::ZERO),
            ValueType::Vec4 => Self::Vec4(Vec4::ZERO),
            ValueType::Uint => Self::Uint(0),
            ValueType::Int => Self::Int(0),
            ValueType::UVec4 => Self::UVec4(UVec4::ZERO),
            ValueType::IVec4 => Self::IVec4(IVec4::ZERO),
        }
    }

    pub const fn ty(&self) -> ValueType {
        match self {
            Self::Float(_) => ValueType::Float,
            Self::Vec2(_) => ValueType::Vec2,
            Self::Vec3(_) => ValueType::Vec3,
            Self::Vec4(_) => ValueType::Vec4,
            Self::Uint(_) => ValueType::Uint,
            Self::Int(_) => ValueType::Int,
            Self::UVec4(_) => ValueType::UVec4,
            Self::IVec4(_) => ValueType::IVec4,
        }
    }

    /// Build a value of type `ty` from a decoded texel, dropping extra components.
    pub fn from_texel(texel: Texel, ty: ValueType) -> Self {
        match ty {
            ValueType::Float => Self::Float(texel.to_vec4().x),
            ValueType::Vec2 => Self::Vec2(texel.to_vec4().truncate().truncate()),
            ValueType::Vec3 => Self::Vec3(texel.to_vec4().truncate()),
            ValueType::Vec4 => Self::Vec4(texel.to_vec4()),
            ValueType::Uint => Self::Uint(texel.to_uvec4().x),
            ValueType::Int => Self::Int(texel.to_ivec4().x),
            ValueType::UVec4 => Self::UVec4(texel.to_uvec4()),
            ValueType::IVec4 => Self::IVec4(texel.to_ivec4()),
        }
    }

    /// Widen to a texel, filling missing components with `(0, 0, 0, 1)`.
    pub fn to_texel(self) -> Texel {
        match self {
            Self::Float(x) => Texel::Float(Vec4::new(x, 0.0, 0.0, 1.0)),
            Self::Vec2(v) => Texel::Float(v.extend(0.0).extend(1.0)),
            Self::Vec3(v) => Texel::Float(v.extend(1.0)),
            Self::Vec4(v) => Texel::Float(v),
            Self::Uint(x) => Texel::Uint(UVec4::new(x, 0, 0, 1)),
            Self::Int(x) => Texel::Sint(IVec4::new(x, 0, 0, 1)),
            Self::UVec4(v) => Texel::Uint(v),
            Self::IVec4(v) => Texel::Sint(v),
        }
    }

    /// Float components padded with zeros, or `None` for integer values.
    pub fn float_components(self) -> Option<Vec4> {
        match self {
            Self::Float(x) => Some(Vec4::new(x, 0.0, 0.0, 0.0)),
            Self::Vec2(v) => Some(v.extend(0.0).extend(0.0)),
            Self::Vec3(v) => Some(v.extend(0.0)),
            Self::Vec4(v) => Some(v),
            _ => None,
        }
    }

    fn with_float_components(self, v: Vec4) -> Self {
        match self {
            Self::Float(_) => Self::Float(v.x),
            Self::Vec2(_) => Self::Vec2(v.truncate().truncate()),
            Self::Vec3(_) => Self::Vec3(v.truncate()),
            Self::Vec4(_) => Self::Vec4(v),
            other => other,
        }
    }

    /// Linear interpolation `a + (b - a) * t`. Integer values keep `a`.
    pub fn lerp(a: Self, b: Self, t: f32) -> Self {
        match (a.float_components(), b.float_components()) {
            (Some(va), Some(vb)) => a.with_float_components(va + (vb - va) * t),
            _ => a,
        }
    }

    /// Weighted sum of three values. Integer values keep the first.
    pub fn weighted(values: [Self; 3], weights: [f32; 3]) -> Self {
        match (
            values[0].float_components(),
            values[1].float_components(),
            values[2].float_components(),
        ) {
            (Some(a), Some(b), Some(c)) => values[0]
                .with_float_components(a * weights[0] + b * weights[1] + c * weights[2]),
            _ => values[0],
        }
    }

    pub fn as_vec4(self) -> Vec4 {
        self.to_texel().to_vec4()
    }

    pub fn as_f32(self) -> f32 {
        self.to_texel().to_vec4().x
    }

    pub fn as_u32(self) -> u32 {
        self.to_texel().to_uvec4().x
    }
}

/// Built-in values with fixed meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// Vertex output: clip-space position (`Vec4`)
    Position,
    /// Vertex output: rasterized point size (`Float`)
    PointSize,
    /// Vertex input: index of the vertex (`Uint`)
    VertexIndex,
    /// Vertex input: index of the instance (`Uint`)
    InstanceIndex,
    /// Fragment input: window coordinates, depth and `1/w` (`Vec4`)
    FragCoord,
    /// Fragment input: 1 for front-facing primitives (`Uint`)
    FrontFacing,
    /// Fragment output: depth override (`Float`)
    FragDepth,
}

impl Builtin {
    pub const fn value_type(self) -> ValueType {
        match self {
            Self::Position | Self::FragCoord => ValueType::Vec4,
            Self::PointSize | Self::FragDepth => ValueType::Float,
            Self::VertexIndex | Self::InstanceIndex | Self::FrontFacing => ValueType::Uint,
        }
    }
}

/// Where a slot's value comes from or goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotBinding {
    Location(u32),
    Builtin(Builtin),
}

/// Interpolation of a varying across a primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Interpolation {
    /// Perspective-correct
    #[default]
    Smooth,
    /// Taken from the provoking vertex
    Flat,
}

/// A named input or output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub binding: SlotBinding,
    pub ty: ValueType,
    pub interpolation: Interpolation,
}

impl Slot {
    pub fn location(name: impl Into<String>, location: u32, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            binding: SlotBinding::Location(location),
            ty,
            interpolation: Interpolation::Smooth,
        }
    }

    pub fn builtin(name: impl Into<String>, builtin: Builtin) -> Self {
        Self {
            name: name.into(),
            binding: SlotBinding::Builtin(builtin),
            ty: builtin.value_type(),
            interpolation: Interpolation::Flat,
        }
    }

    /// Mark the slot as flat-interpolated.
    #[must_use]
    pub fn flat(mut self) -> Self {
        self.interpolation = Interpolation::Flat;
        self
    }
}

/// Ordered inputs and outputs of a stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    pub inputs: Vec<Slot>,
    pub outputs: Vec<Slot>,
}

impl Signature {
    pub fn new(inputs: Vec<Slot>, outputs: Vec<Slot>) -> Self {
        Self { inputs, outputs }
    }

    fn find(slots: &[Slot], binding: SlotBinding) -> Option<(usize, &Slot)> {
        slots.iter().enumerate().find(|(_, s)| s.binding == binding)
    }

    pub fn input(&self, binding: SlotBinding) -> Option<(usize, &Slot)> {
        Self::find(&self.inputs, binding)
    }

    pub fn output(&self, binding: SlotBinding) -> Option<(usize, &Slot)> {
        Self::find(&self.outputs, binding)
    }

    /// Output buffer pre-filled with zeros of the declared types.
    pub fn zeroed_outputs(&self) -> Vec<Value> {
        self.outputs.iter().map(|s| Value::zero(s.ty)).collect()
    }
}

/// Pipeline stage a shader runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Vertex,
    Fragment,
}

/// Read-only view of the resources bound for a draw.
#[derive(Clone, Copy)]
pub struct ShaderContext<'a> {
    pub push_constants: &'a [u8],
    pub resources: &'a DescriptorBindings,
}

impl<'a> ShaderContext<'a> {
    pub const fn new(push_constants: &'a [u8], resources: &'a DescriptorBindings) -> Self {
        Self {
            push_constants,
            resources,
        }
    }

    /// Read a value from the push-constant block.
    pub fn push_constant<T: Pod>(&self, offset: usize) -> Option<T> {
        read_pod(self.push_constants, offset)
    }

    /// Read a value from a uniform or storage buffer binding.
    pub fn buffer<T: Pod>(&self, set: u32, binding: u32, offset: usize) -> Option<T> {
        read_pod(self.resources.buffer(set, binding)?, offset)
    }

    /// Filtered sample of a combined image sampler at normalized coordinates.
    pub fn sample(&self, set: u32, binding: u32, uv: Vec2) -> Option<Texel> {
        let texture = self.resources.texture(set, binding)?;
        texture.sampler.sample(&texture.surface, uv).ok()
    }

    /// Unfiltered fetch of element `index` from a texel buffer binding.
    pub fn texel_fetch(&self, set: u32, binding: u32, index: u32) -> Option<Texel> {
        let surface = self.resources.texel_buffer(set, binding)?;
        SamplerState::default()
            .fetch(surface, index as i32, 0)
            .ok()
    }
}

fn read_pod<T: Pod>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(std::mem::size_of::<T>())?;
    bytes
        .get(offset..end)
        .map(bytemuck::pod_read_unaligned::<T>)
}

/// An opaque shader stage.
pub trait ShaderStage: Send + Sync + fmt::Debug {
    /// Stage this shader runs in.
    fn kind(&self) -> StageKind;

    /// Declared inputs and outputs.
    fn signature(&self) -> &Signature;

    /// Run one invocation. `inputs` and `outputs` follow the signature order;
    /// outputs arrive zeroed with their declared types.
    fn invoke(&self, ctx: &ShaderContext<'_>, inputs: &[Value], outputs: &mut [Value]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn texel_conversions_fill_defaults() {
        assert_eq!(
            Value::Vec2(Vec2::new(0.5, 0.25)).to_texel(),
            Texel::Float(Vec4::new(0.5, 0.25, 0.0, 1.0))
        );
        assert_eq!(
            Value::from_texel(Texel::Float(Vec4::new(1.0, 2.0, 3.0, 4.0)), ValueType::Vec3),
            Value::Vec3(Vec3::new(1.0, 2.0, 3.0))
        );
        assert_eq!(
            Value::from_texel(Texel::Uint(UVec4::new(7, 0, 0, 1)), ValueType::Uint),
            Value::Uint(7)
        );
    }

    #[test]
    fn lerp_and_weighted() {
        let a = Value::Vec2(Vec2::new(0.0, 10.0));
        let b = Value::Vec2(Vec2::new(1.0, 20.0));
        assert_eq!(Value::lerp(a, b, 0.5), Value::Vec2(Vec2::new(0.5, 15.0)));

        let Value::Float(x) = Value::weighted(
            [Value::Float(1.0), Value::Float(2.0), Value::Float(4.0)],
            [0.25, 0.25, 0.5],
        ) else {
            panic!("expected float")
        };
        assert_relative_eq!(x, 2.75);

        assert_eq!(
            Value::lerp(Value::Uint(3), Value::Uint(9), 0.5),
            Value::Uint(3)
        );
    }

    #[test]
    fn push_constant_reads_are_bounds_checked() {
        let bindings = DescriptorBindings::default();
        let data = bytemuck::bytes_of(&[1.0f32, 2.0]).to_vec();
        let ctx = ShaderContext::new(&data, &bindings);

        assert_eq!(ctx.push_constant::<f32>(4), Some(2.0));
        assert_eq!(ctx.push_constant::<f32>(6), None);
        assert_eq!(ctx.buffer::<u32>(0, 0, 0), None);
    }
}
