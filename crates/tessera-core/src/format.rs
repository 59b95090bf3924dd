//! Texel formats with bit-exact encode and decode.
//!
//! Normalized formats follow the usual conversions: UNORM reads as
//! `v / (2^n - 1)` and writes as `round(clamp(x, 0, 1) * (2^n - 1))`, SNORM
//! reads as `max(v / (2^(n-1) - 1), -1)`, and SRGB applies the sRGB transfer
//! function to the color channels only. Integer formats are exact and SFLOAT
//! formats use IEEE half or single precision.

use crate::error::{Error, Result};
use crate::types::ImageAspectFlags;
use glam::{IVec4, UVec4, Vec4};
use half::f16;
use serde::{Deserialize, Serialize};

/// Supported texel formats. Discriminants match the Vulkan enum values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Format {
    R5G6B5UnormPack16 = 4,
    R8Unorm = 9,
    R8Snorm = 10,
    R8Uint = 13,
    R8Sint = 14,
    R8G8Unorm = 16,
    R8G8Uint = 20,
    R8G8B8A8Unorm = 37,
    R8G8B8A8Snorm = 38,
    R8G8B8A8Uint = 41,
    R8G8B8A8Sint = 42,
    R8G8B8A8Srgb = 43,
    B8G8R8A8Unorm = 44,
    B8G8R8A8Srgb = 50,
    A2B10G10R10UnormPack32 = 64,
    R16Unorm = 70,
    R16Uint = 74,
    R16Sfloat = 76,
    R16G16Sfloat = 83,
    R16G16B16A16Sfloat = 97,
    R32Uint = 98,
    R32Sint = 99,
    R32Sfloat = 100,
    R32G32Sfloat = 103,
    R32G32B32Sfloat = 106,
    R32G32B32A32Uint = 107,
    R32G32B32A32Sint = 108,
    R32G32B32A32Sfloat = 109,
    D16Unorm = 124,
    X8D24UnormPack32 = 125,
    D32Sfloat = 126,
    S8Uint = 127,
    D24UnormS8Uint = 129,
    D32SfloatS8Uint = 130,
}

/// Interpretation of a format's stored bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NumericFormat {
    Unorm,
    Snorm,
    Uint,
    Sint,
    Srgb,
    Sfloat,
}

impl NumericFormat {
    /// Shader-visible value class produced by this numeric format.
    pub const fn class(self) -> TexelClass {
        match self {
            Self::Uint => TexelClass::Uint,
            Self::Sint => TexelClass::Sint,
            Self::Unorm | Self::Snorm | Self::Srgb | Self::Sfloat => TexelClass::Float,
        }
    }
}

/// Static description of a format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bytes per texel
    pub texel_size: u32,
    /// Number of stored components
    pub components: u32,
    /// Numeric interpretation of the color or depth channels
    pub numeric: NumericFormat,
    /// Aspects present in the format
    pub aspects: ImageAspectFlags,
}

#[derive(Clone, Copy)]
enum Layout {
    Array { channel_bytes: usize, bgra: bool },
    R5G6B5,
    A2B10G10R10,
    D16,
    X8D24,
    D32,
    S8,
    D24S8,
    D32S8,
}

impl Format {
    /// Every supported format.
    pub const ALL: &'static [Self] = &[
        Self::R5G6B5UnormPack16,
        Self::R8Unorm,
        Self::R8Snorm,
        Self::R8Uint,
        Self::R8Sint,
        Self::R8G8Unorm,
        Self::R8G8Uint,
        Self::R8G8B8A8Unorm,
        Self::R8G8B8A8Snorm,
        Self::R8G8B8A8Uint,
        Self::R8G8B8A8Sint,
        Self::R8G8B8A8Srgb,
        Self::B8G8R8A8Unorm,
        Self::B8G8R8A8Srgb,
        Self::A2B10G10R10UnormPack32,
        Self::R16Unorm,
        Self::R16Uint,
        Self::R16Sfloat,
        Self::R16G16Sfloat,
        Self::R16G16B16A16Sfloat,
        Self::R32Uint,
        Self::R32Sint,
        Self::R32Sfloat,
        Self::R32G32Sfloat,
        Self::R32G32B32Sfloat,
        Self::R32G32B32A32Uint,
        Self::R32G32B32A32Sint,
        Self::R32G32B32A32Sfloat,
        Self::D16Unorm,
        Self::X8D24UnormPack32,
        Self::D32Sfloat,
        Self::S8Uint,
        Self::D24UnormS8Uint,
        Self::D32SfloatS8Uint,
    ];

    /// Look up a format by its raw Vulkan value.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_raw() == raw)
            .ok_or_else(|| Error::UnsupportedFormat(format!("raw value {raw}")))
    }

    /// Raw Vulkan value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Static description of this format.
    pub const fn info(self) -> FormatInfo {
        use NumericFormat::{Sfloat, Sint, Snorm, Srgb, Uint, Unorm};
        let color = ImageAspectFlags::COLOR;
        let (texel_size, components, numeric, aspects) = match self {
            Self::R5G6B5UnormPack16 => (2, 3, Unorm, color),
            Self::R8Unorm => (1, 1, Unorm, color),
            Self::R8Snorm => (1, 1, Snorm, color),
            Self::R8Uint => (1, 1, Uint, color),
            Self::R8Sint => (1, 1, Sint, color),
            Self::R8G8Unorm => (2, 2, Unorm, color),
            Self::R8G8Uint => (2, 2, Uint, color),
            Self::R8G8B8A8Unorm | Self::B8G8R8A8Unorm => (4, 4, Unorm, color),
            Self::R8G8B8A8Snorm => (4, 4, Snorm, color),
            Self::R8G8B8A8Uint => (4, 4, Uint, color),
            Self::R8G8B8A8Sint => (4, 4, Sint, color),
            Self::R8G8B8A8Srgb | Self::B8G8R8A8Srgb => (4, 4, Srgb, color),
            Self::A2B10G10R10UnormPack32 => (4, 4, Unorm, color),
            Self::R16Unorm => (2, 1, Unorm, color),
            Self::R16Uint => (2, 1, Uint, color),
            Self::R16Sfloat => (2, 1, Sfloat, color),
            Self::R16G16Sfloat => (4, 2, Sfloat, color),
            Self::R16G16B16A16Sfloat => (8, 4, Sfloat, color),
            Self::R32Uint => (4, 1, Uint, color),
            Self::R32Sint => (4, 1, Sint, color),
            Self::R32Sfloat => (4, 1, Sfloat, color),
            Self::R32G32Sfloat => (8, 2, Sfloat, color),
            Self::R32G32B32Sfloat => (12, 3, Sfloat, color),
            Self::R32G32B32A32Uint => (16, 4, Uint, color),
            Self::R32G32B32A32Sint => (16, 4, Sint, color),
            Self::R32G32B32A32Sfloat => (16, 4, Sfloat, color),
            Self::D16Unorm => (2, 1, Unorm, ImageAspectFlags::DEPTH),
            Self::X8D24UnormPack32 => (4, 1, Unorm, ImageAspectFlags::DEPTH),
            Self::D32Sfloat => (4, 1, Sfloat, ImageAspectFlags::DEPTH),
            Self::S8Uint => (1, 1, Uint, ImageAspectFlags::STENCIL),
            Self::D24UnormS8Uint => (
                4,
                2,
                Unorm,
                ImageAspectFlags::DEPTH.union(ImageAspectFlags::STENCIL),
            ),
            Self::D32SfloatS8Uint => (
                8,
                2,
                Sfloat,
                ImageAspectFlags::DEPTH.union(ImageAspectFlags::STENCIL),
            ),
        };
        FormatInfo {
            texel_size,
            components,
            numeric,
            aspects,
        }
    }

    const fn layout(self) -> Layout {
        match self {
            Self::R5G6B5UnormPack16 => Layout::R5G6B5,
            Self::A2B10G10R10UnormPack32 => Layout::A2B10G10R10,
            Self::B8G8R8A8Unorm | Self::B8G8R8A8Srgb => Layout::Array {
                channel_bytes: 1,
                bgra: true,
            },
            Self::R16Unorm
            | Self::R16Uint
            | Self::R16Sfloat
            | Self::R16G16Sfloat
            | Self::R16G16B16A16Sfloat => Layout::Array {
                channel_bytes: 2,
                bgra: false,
            },
            Self::R32Uint
            | Self::R32Sint
            | Self::R32Sfloat
            | Self::R32G32Sfloat
            | Self::R32G32B32Sfloat
            | Self::R32G32B32A32Uint
            | Self::R32G32B32A32Sint
            | Self::R32G32B32A32Sfloat => Layout::Array {
                channel_bytes: 4,
                bgra: false,
            },
            Self::D16Unorm => Layout::D16,
            Self::X8D24UnormPack32 => Layout::X8D24,
            Self::D32Sfloat => Layout::D32,
            Self::S8Uint => Layout::S8,
            Self::D24UnormS8Uint => Layout::D24S8,
            Self::D32SfloatS8Uint => Layout::D32S8,
            _ => Layout::Array {
                channel_bytes: 1,
                bgra: false,
            },
        }
    }

    /// Bytes per texel.
    #[inline]
    pub const fn texel_size(self) -> u32 {
        self.info().texel_size
    }

    #[inline]
    pub const fn aspects(self) -> ImageAspectFlags {
        self.info().aspects
    }

    #[inline]
    pub const fn is_color(self) -> bool {
        self.aspects().contains(ImageAspectFlags::COLOR)
    }

    #[inline]
    pub const fn has_depth(self) -> bool {
        self.aspects().contains(ImageAspectFlags::DEPTH)
    }

    #[inline]
    pub const fn has_stencil(self) -> bool {
        self.aspects().contains(ImageAspectFlags::STENCIL)
    }

    /// Value class a shader reads from or writes to this format.
    #[inline]
    pub const fn class(self) -> TexelClass {
        self.info().numeric.class()
    }

    /// Whether blending and filtering apply (float or normalized color).
    #[inline]
    pub const fn is_blendable(self) -> bool {
        self.is_color() && matches!(self.class(), TexelClass::Float)
    }

    fn check_len(self, len: usize) -> Result<()> {
        let need = self.texel_size() as usize;
        if len < need {
            return Err(Error::OutOfBounds(format!(
                "{self:?} texel needs {need} bytes, got {len}"
            )));
        }
        Ok(())
    }

    /// Decode one texel.
    ///
    /// Missing components are filled with `(0, 0, 0, 1)`. Depth formats
    /// decode their depth into the first component and stencil-only
    /// formats decode as an unsigned integer.
    pub fn decode(self, bytes: &[u8]) -> Result<Texel> {
        self.check_len(bytes.len())?;
        let info = self.info();
        let texel = match self.layout() {
            Layout::Array {
                channel_bytes,
                bgra,
            } => decode_array(bytes, channel_bytes, bgra, info),
            Layout::R5G6B5 => {
                let v = u32::from(read_u16(bytes, 0));
                Texel::Float(Vec4::new(
                    unorm_to_float((v >> 11) & 0x1f, 5),
                    unorm_to_float((v >> 5) & 0x3f, 6),
                    unorm_to_float(v & 0x1f, 5),
                    1.0,
                ))
            }
            Layout::A2B10G10R10 => {
                let v = read_u32(bytes, 0);
                Texel::Float(Vec4::new(
                    unorm_to_float(v & 0x3ff, 10),
                    unorm_to_float((v >> 10) & 0x3ff, 10),
                    unorm_to_float((v >> 20) & 0x3ff, 10),
                    unorm_to_float(v >> 30, 2),
                ))
            }
            Layout::S8 => Texel::Uint(UVec4::new(u32::from(bytes[0]), 0, 0, 1)),
            Layout::D16 | Layout::X8D24 | Layout::D32 | Layout::D24S8 | Layout::D32S8 => {
                Texel::Float(Vec4::new(self.read_depth(bytes)?, 0.0, 0.0, 1.0))
            }
        };
        Ok(texel)
    }

    /// Encode one texel, converting between value classes when needed.
    ///
    /// Depth formats take the depth from the first component; the stencil
    /// bits of combined formats are left untouched.
    pub fn encode(self, texel: Texel, out: &mut [u8]) -> Result<()> {
        self.check_len(out.len())?;
        let info = self.info();
        match self.layout() {
            Layout::Array {
                channel_bytes,
                bgra,
            } => encode_array(texel, out, channel_bytes, bgra, info),
            Layout::R5G6B5 => {
                let v = texel.to_vec4();
                let packed = (float_to_unorm(v.x, 5) << 11)
                    | (float_to_unorm(v.y, 6) << 5)
                    | float_to_unorm(v.z, 5);
                write_u16(out, 0, packed as u16);
            }
            Layout::A2B10G10R10 => {
                let v = texel.to_vec4();
                let packed = float_to_unorm(v.x, 10)
                    | (float_to_unorm(v.y, 10) << 10)
                    | (float_to_unorm(v.z, 10) << 20)
                    | (float_to_unorm(v.w, 2) << 30);
                write_u32(out, 0, packed);
            }
            Layout::S8 => out[0] = texel.to_uvec4().x.min(0xff) as u8,
            Layout::D16 | Layout::X8D24 | Layout::D32 | Layout::D24S8 | Layout::D32S8 => {
                self.write_depth(out, texel.to_vec4().x)?;
            }
        }
        Ok(())
    }

    /// Read the depth aspect of one texel.
    pub fn read_depth(self, bytes: &[u8]) -> Result<f32> {
        self.check_len(bytes.len())?;
        match self.layout() {
            Layout::D16 => Ok(unorm_to_float(u32::from(read_u16(bytes, 0)), 16)),
            Layout::X8D24 | Layout::D24S8 => Ok(unorm_to_float(read_u32(bytes, 0) & 0x00ff_ffff, 24)),
            Layout::D32 | Layout::D32S8 => Ok(f32::from_bits(read_u32(bytes, 0))),
            _ => Err(Error::UnsupportedFormat(format!("{self:?} has no depth aspect"))),
        }
    }

    /// Write the depth aspect of one texel, clamping to `[0, 1]`.
    pub fn write_depth(self, out: &mut [u8], depth: f32) -> Result<()> {
        self.check_len(out.len())?;
        let depth = if depth.is_nan() { 0.0 } else { depth.clamp(0.0, 1.0) };
        match self.layout() {
            Layout::D16 => write_u16(out, 0, float_to_unorm(depth, 16) as u16),
            Layout::X8D24 => write_u32(out, 0, float_to_unorm(depth, 24)),
            Layout::D24S8 => {
                let stencil = read_u32(out, 0) & 0xff00_0000;
                write_u32(out, 0, stencil | float_to_unorm(depth, 24));
            }
            Layout::D32 | Layout::D32S8 => write_u32(out, 0, depth.to_bits()),
            _ => {
                return Err(Error::UnsupportedFormat(format!(
                    "{self:?} has no depth aspect"
                )))
            }
        }
        Ok(())
    }

    /// Read the stencil aspect of one texel.
    pub fn read_stencil(self, bytes: &[u8]) -> Result<u8> {
        self.check_len(bytes.len())?;
        match self.layout() {
            Layout::S8 => Ok(bytes[0]),
            Layout::D24S8 => Ok(bytes[3]),
            Layout::D32S8 => Ok(bytes[4]),
            _ => Err(Error::UnsupportedFormat(format!("{self:?} has no stencil aspect"))),
        }
    }

    /// Write the stencil aspect of one texel.
    pub fn write_stencil(self, out: &mut [u8], stencil: u8) -> Result<()> {
        self.check_len(out.len())?;
        match self.layout() {
            Layout::S8 => out[0] = stencil,
            Layout::D24S8 => out[3] = stencil,
            Layout::D32S8 => out[4] = stencil,
            _ => {
                return Err(Error::UnsupportedFormat(format!(
                    "{self:?} has no stencil aspect"
                )))
            }
        }
        Ok(())
    }

    /// Encode a single value into a freshly allocated texel.
    pub fn encode_to_vec(self, texel: Texel) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.texel_size() as usize];
        self.encode(texel, &mut out)?;
        Ok(out)
    }
}

impl TryFrom<u32> for Format {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        Self::from_raw(raw)
    }
}

/// Value class of a texel as seen by shaders and blending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TexelClass {
    Float,
    Uint,
    Sint,
}

/// A decoded texel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Texel {
    Float(Vec4),
    Uint(UVec4),
    Sint(IVec4),
}

impl Default for Texel {
    fn default() -> Self {
        Self::Float(Vec4::ZERO)
    }
}

impl Texel {
    pub const fn class(self) -> TexelClass {
        match self {
            Self::Float(_) => TexelClass::Float,
            Self::Uint(_) => TexelClass::Uint,
            Self::Sint(_) => TexelClass::Sint,
        }
    }

    pub fn to_vec4(self) -> Vec4 {
        match self {
            Self::Float(v) => v,
            Self::Uint(v) => v.as_vec4(),
            Self::Sint(v) => v.as_vec4(),
        }
    }

    pub fn to_uvec4(self) -> UVec4 {
        match self {
            Self::Float(v) => v.as_uvec4(),
            Self::Uint(v) => v,
            Self::Sint(v) => v.as_uvec4(),
        }
    }

    pub fn to_ivec4(self) -> IVec4 {
        match self {
            Self::Float(v) => v.as_ivec4(),
            Self::Uint(v) => v.as_ivec4(),
            Self::Sint(v) => v,
        }
    }
}

/// Convert an sRGB-encoded channel to linear.
pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Convert a linear channel to sRGB encoding.
pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn unorm_max(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

#[inline]
fn unorm_to_float(v: u32, bits: u32) -> f32 {
    v as f32 / unorm_max(bits) as f32
}

#[inline]
fn float_to_unorm(x: f32, bits: u32) -> u32 {
    let max = unorm_max(bits);
    // NaN saturates to zero in the float-to-int cast
    (x.clamp(0.0, 1.0) * max as f32).round() as u32
}

#[inline]
fn snorm_to_float(v: i32, bits: u32) -> f32 {
    let max = ((1i32 << (bits - 1)) - 1) as f32;
    (v as f32 / max).max(-1.0)
}

#[inline]
fn float_to_snorm(x: f32, bits: u32) -> i32 {
    let max = ((1i32 << (bits - 1)) - 1) as f32;
    (x.clamp(-1.0, 1.0) * max).round() as i32
}

fn read_u16(b: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([b[offset], b[offset + 1]])
}

fn read_u32(b: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
}

fn write_u16(b: &mut [u8], offset: usize, v: u16) {
    b[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(b: &mut [u8], offset: usize, v: u32) {
    b[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn decode_array(bytes: &[u8], channel_bytes: usize, bgra: bool, info: FormatInfo) -> Texel {
    let components = info.components as usize;
    let raw = |i: usize| -> u32 {
        let o = i * channel_bytes;
        match channel_bytes {
            1 => u32::from(bytes[o]),
            2 => u32::from(read_u16(bytes, o)),
            _ => read_u32(bytes, o),
        }
    };
    let bits = channel_bytes as u32 * 8;

    let mut texel = match info.numeric.class() {
        TexelClass::Float => {
            let mut v = [0.0, 0.0, 0.0, 1.0];
            for (i, slot) in v.iter_mut().enumerate().take(components) {
                let r = raw(i);
                *slot = match info.numeric {
                    NumericFormat::Unorm => unorm_to_float(r, bits),
                    NumericFormat::Snorm => snorm_to_float(sign_extend(r, bits), bits),
                    NumericFormat::Srgb if i < 3 => srgb_to_linear(unorm_to_float(r, bits)),
                    NumericFormat::Srgb => unorm_to_float(r, bits),
                    _ if channel_bytes == 2 => f16::from_bits(r as u16).to_f32(),
                    _ => f32::from_bits(r),
                };
            }
            Texel::Float(Vec4::from_array(v))
        }
        TexelClass::Uint => {
            let mut v = [0, 0, 0, 1];
            for (i, slot) in v.iter_mut().enumerate().take(components) {
                *slot = raw(i);
            }
            Texel::Uint(UVec4::from_array(v))
        }
        TexelClass::Sint => {
            let mut v = [0, 0, 0, 1];
            for (i, slot) in v.iter_mut().enumerate().take(components) {
                *slot = sign_extend(raw(i), bits);
            }
            Texel::Sint(IVec4::from_array(v))
        }
    };

    if bgra {
        texel = match texel {
            Texel::Float(v) => Texel::Float(Vec4::new(v.z, v.y, v.x, v.w)),
            other => other,
        };
    }
    texel
}

fn encode_array(texel: Texel, out: &mut [u8], channel_bytes: usize, bgra: bool, info: FormatInfo) {
    let components = info.components as usize;
    let bits = channel_bytes as u32 * 8;
    let mut put = |i: usize, v: u32| {
        let o = i * channel_bytes;
        match channel_bytes {
            1 => out[o] = v as u8,
            2 => write_u16(out, o, v as u16),
            _ => write_u32(out, o, v),
        }
    };

    match info.numeric.class() {
        TexelClass::Float => {
            let mut v = texel.to_vec4();
            if bgra {
                v = Vec4::new(v.z, v.y, v.x, v.w);
            }
            for (i, &x) in v.to_array().iter().enumerate().take(components) {
                let raw = match info.numeric {
                    NumericFormat::Unorm => float_to_unorm(x, bits),
                    NumericFormat::Snorm => float_to_snorm(x, bits) as u32 & unorm_max(bits),
                    NumericFormat::Srgb if i < 3 => {
                        float_to_unorm(linear_to_srgb(x.clamp(0.0, 1.0)), bits)
                    }
                    NumericFormat::Srgb => float_to_unorm(x, bits),
                    _ if channel_bytes == 2 => u32::from(f16::from_f32(x).to_bits()),
                    _ => x.to_bits(),
                };
                put(i, raw);
            }
        }
        TexelClass::Uint => {
            let max = unorm_max(bits);
            for (i, &x) in texel.to_uvec4().to_array().iter().enumerate().take(components) {
                put(i, x.min(max));
            }
        }
        TexelClass::Sint => {
            let (lo, hi) = if bits >= 32 {
                (i32::MIN, i32::MAX)
            } else {
                (-(1i32 << (bits - 1)), (1i32 << (bits - 1)) - 1)
            };
            for (i, &x) in texel.to_ivec4().to_array().iter().enumerate().take(components) {
                put(i, x.clamp(lo, hi) as u32 & unorm_max(bits));
            }
        }
    }
}

#[inline]
fn sign_extend(v: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((v << shift) as i32) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn raw_values_round_trip() {
        for &format in Format::ALL {
            assert_eq!(Format::from_raw(format.as_raw()).unwrap(), format);
        }
        assert!(Format::from_raw(0).is_err());
        assert!(Format::from_raw(11).is_err());
    }

    #[test]
    fn rgba8_unorm_is_bit_exact() {
        let format = Format::R8G8B8A8Unorm;
        let texel = format.decode(&[255, 0, 128, 1]).unwrap();
        let Texel::Float(v) = texel else {
            panic!("expected float texel")
        };
        assert_eq!(v.x, 1.0);
        assert_eq!(v.y, 0.0);
        assert_relative_eq!(v.z, 128.0 / 255.0);

        let mut out = [0u8; 4];
        format.encode(texel, &mut out).unwrap();
        assert_eq!(out, [255, 0, 128, 1]);
    }

    #[test]
    fn every_byte_value_survives_unorm8() {
        for v in 0..=255u8 {
            let texel = Format::R8Unorm.decode(&[v]).unwrap();
            let mut out = [0u8];
            Format::R8Unorm.encode(texel, &mut out).unwrap();
            assert_eq!(out[0], v);
        }
    }

    #[test]
    fn unorm_clamps_on_write() {
        let mut out = [0u8; 4];
        Format::R8G8B8A8Unorm
            .encode(Texel::Float(Vec4::new(1.5, -0.3, f32::NAN, 0.5)), &mut out)
            .unwrap();
        assert_eq!(out, [255, 0, 0, 128]);
    }

    #[test]
    fn snorm_minimum_reads_as_minus_one() {
        let Texel::Float(v) = Format::R8Snorm.decode(&[0x80]).unwrap() else {
            panic!("expected float texel")
        };
        assert_eq!(v.x, -1.0);

        let mut out = [0u8];
        Format::R8Snorm
            .encode(Texel::Float(Vec4::splat(-1.0)), &mut out)
            .unwrap();
        assert_eq!(out[0] as i8, -127);
    }

    #[test]
    fn bgra_swizzles_channels() {
        let Texel::Float(v) = Format::B8G8R8A8Unorm.decode(&[0, 0, 255, 255]).unwrap() else {
            panic!("expected float texel")
        };
        assert_eq!(v, Vec4::new(1.0, 0.0, 0.0, 1.0));

        let out = Format::B8G8R8A8Unorm
            .encode_to_vec(Texel::Float(Vec4::new(1.0, 0.0, 0.0, 1.0)))
            .unwrap();
        assert_eq!(out, vec![0, 0, 255, 255]);
    }

    #[test]
    fn srgb_round_trips_every_byte() {
        for v in 0..=255u8 {
            let texel = Format::R8G8B8A8Srgb.decode(&[v, v, v, v]).unwrap();
            let out = Format::R8G8B8A8Srgb.encode_to_vec(texel).unwrap();
            assert_eq!(out, vec![v, v, v, v]);
        }
    }

    #[test]
    fn integer_formats_are_exact() {
        let Texel::Sint(v) = Format::R8G8B8A8Sint.decode(&[0xff, 0x7f, 0x80, 0]).unwrap() else {
            panic!("expected sint texel")
        };
        assert_eq!(v, IVec4::new(-1, 127, -128, 0));

        let out = Format::R32Uint
            .encode_to_vec(Texel::Uint(UVec4::new(0xdead_beef, 0, 0, 0)))
            .unwrap();
        assert_eq!(out, 0xdead_beef_u32.to_le_bytes().to_vec());
    }

    #[test]
    fn missing_components_default_to_zero_zero_zero_one() {
        let Texel::Float(v) = Format::R32G32Sfloat
            .decode(bytemuck::cast_slice(&[0.25f32, 0.5]))
            .unwrap()
        else {
            panic!("expected float texel")
        };
        assert_eq!(v, Vec4::new(0.25, 0.5, 0.0, 1.0));
    }

    #[test]
    fn half_float_round_trip() {
        let out = Format::R16G16B16A16Sfloat
            .encode_to_vec(Texel::Float(Vec4::new(0.5, -2.0, 1024.0, 1.0)))
            .unwrap();
        let Texel::Float(v) = Format::R16G16B16A16Sfloat.decode(&out).unwrap() else {
            panic!("expected float texel")
        };
        assert_eq!(v, Vec4::new(0.5, -2.0, 1024.0, 1.0));
    }

    #[test]
    fn packed_formats() {
        let out = Format::R5G6B5UnormPack16
            .encode_to_vec(Texel::Float(Vec4::new(1.0, 0.0, 1.0, 1.0)))
            .unwrap();
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 0xf81f);

        let out = Format::A2B10G10R10UnormPack32
            .encode_to_vec(Texel::Float(Vec4::new(1.0, 0.0, 0.0, 1.0)))
            .unwrap();
        assert_eq!(u32::from_le_bytes([out[0], out[1], out[2], out[3]]), 0xc000_03ff);
    }

    #[test]
    fn depth_stencil_aspects_are_independent() {
        let format = Format::D24UnormS8Uint;
        let mut texel = [0u8; 4];
        format.write_stencil(&mut texel, 0xab).unwrap();
        format.write_depth(&mut texel, 1.0).unwrap();

        assert_eq!(format.read_stencil(&texel).unwrap(), 0xab);
        assert_eq!(format.read_depth(&texel).unwrap(), 1.0);

        let mut d16 = [0u8; 2];
        Format::D16Unorm.write_depth(&mut d16, 2.0).unwrap();
        assert_eq!(Format::D16Unorm.read_depth(&d16).unwrap(), 1.0);
        assert!(Format::D16Unorm.read_stencil(&d16).is_err());
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(matches!(
            Format::R32G32B32A32Sfloat.decode(&[0u8; 8]),
            Err(Error::OutOfBounds(_))
        ));
    }
}
