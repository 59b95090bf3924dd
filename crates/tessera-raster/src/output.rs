//! Per-fragment tests and attachment writes.

use crate::error::Result;
use crate::pipeline::PipelineState;
use crate::state::{
    BlendFactor, BlendOp, ColorBlendAttachment, ColorComponentFlags, DynamicState, StencilOp,
    StencilOpState,
};
use crate::surface::Surface;
use glam::Vec4;
use tessera_core::format::{NumericFormat, TexelClass};
use tessera_core::{Format, Texel};

/// What happened to a fragment in the output merger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Written,
    StencilFailed,
    DepthFailed,
}

/// Run the stencil and depth tests for the fragment at `(x, y)`, applying
/// the stencil ops and depth write. Returns whether color writes proceed.
pub(crate) fn depth_stencil(
    state: &PipelineState,
    dynamic: &DynamicState,
    surface: Option<&mut Surface>,
    x: u32,
    y: u32,
    depth: f32,
    front_facing: bool,
) -> Result<Outcome> {
    let Some(surface) = surface else {
        return Ok(Outcome::Written);
    };
    let ds = &state.depth_stencil;
    let format = surface.format();
    let stencil_enabled = ds.stencil_test && format.has_stencil();
    let depth_enabled = ds.depth_test && format.has_depth();

    let (face, reference) = if front_facing {
        (&ds.front, dynamic.stencil_reference[0] as u8)
    } else {
        (&ds.back, dynamic.stencil_reference[1] as u8)
    };

    if stencil_enabled {
        let stored = surface.read_stencil(x, y)?;
        let mask = face.compare_mask as u8;
        if !face.compare_op.test(reference & mask, stored & mask) {
            update_stencil(surface, face, x, y, stored, reference, face.fail_op)?;
            return Ok(Outcome::StencilFailed);
        }
    }

    if depth_enabled {
        let fragment = quantize_depth(format, depth)?;
        let stored = surface.read_depth(x, y)?;
        if !ds.depth_compare_op.test(fragment, stored) {
            if stencil_enabled {
                let stored = surface.read_stencil(x, y)?;
                update_stencil(surface, face, x, y, stored, reference, face.depth_fail_op)?;
            }
            return Ok(Outcome::DepthFailed);
        }
    }

    if stencil_enabled {
        let stored = surface.read_stencil(x, y)?;
        update_stencil(surface, face, x, y, stored, reference, face.pass_op)?;
    }
    if depth_enabled && ds.depth_write {
        surface.write_depth(x, y, depth)?;
    }
    Ok(Outcome::Written)
}

fn update_stencil(
    surface: &mut Surface,
    face: &StencilOpState,
    x: u32,
    y: u32,
    stored: u8,
    reference: u8,
    op: StencilOp,
) -> Result<()> {
    let mask = face.write_mask as u8;
    let value = (stored & !mask) | (op.apply(stored, reference) & mask);
    if value != stored {
        surface.write_stencil(x, y, value)?;
    }
    Ok(())
}

/// Depth as it would read back after a round trip through `format`.
fn quantize_depth(format: Format, depth: f32) -> Result<f32> {
    let mut bytes = [0u8; 8];
    format.write_depth(&mut bytes, depth)?;
    Ok(format.read_depth(&bytes)?)
}

/// Blend `value` into the texel at `(x, y)` and write it through the mask.
pub(crate) fn write_color(
    surface: &mut Surface,
    blend: &ColorBlendAttachment,
    constants: [f32; 4],
    x: u32,
    y: u32,
    value: Texel,
) -> Result<()> {
    let mask = blend.color_write_mask;
    if mask.is_empty() {
        return Ok(());
    }
    let format = surface.format();
    let blending = blend.blend_enable && format.is_blendable();
    let dst = if blending || mask != ColorComponentFlags::RGBA {
        Some(surface.read(x, y)?)
    } else {
        None
    };

    let mut out = value;
    if blending {
        if let Some(dst) = dst {
            let clamp = clamp_range(format.info().numeric);
            let src = clamp_vec(value.to_vec4(), clamp);
            let constant = clamp_vec(Vec4::from_array(constants), clamp);
            out = Texel::Float(blend_values(blend, src, dst.to_vec4(), constant));
        }
    }
    if mask != ColorComponentFlags::RGBA {
        if let Some(dst) = dst {
            out = apply_write_mask(out, dst, mask);
        }
    }
    surface.write(x, y, out)
}

fn clamp_range(numeric: NumericFormat) -> Option<(f32, f32)> {
    match numeric {
        NumericFormat::Unorm | NumericFormat::Srgb => Some((0.0, 1.0)),
        NumericFormat::Snorm => Some((-1.0, 1.0)),
        _ => None,
    }
}

fn clamp_vec(v: Vec4, range: Option<(f32, f32)>) -> Vec4 {
    match range {
        Some((lo, hi)) => v.clamp(Vec4::splat(lo), Vec4::splat(hi)),
        None => v,
    }
}

/// Blend factor with the color factor in `xyz` and the alpha factor in `w`.
fn factor(kind: BlendFactor, src: Vec4, dst: Vec4, constant: Vec4) -> Vec4 {
    match kind {
        BlendFactor::Zero => Vec4::ZERO,
        BlendFactor::One => Vec4::ONE,
        BlendFactor::SrcColor => src,
        BlendFactor::OneMinusSrcColor => Vec4::ONE - src,
        BlendFactor::DstColor => dst,
        BlendFactor::OneMinusDstColor => Vec4::ONE - dst,
        BlendFactor::SrcAlpha => Vec4::splat(src.w),
        BlendFactor::OneMinusSrcAlpha => Vec4::splat(1.0 - src.w),
        BlendFactor::DstAlpha => Vec4::splat(dst.w),
        BlendFactor::OneMinusDstAlpha => Vec4::splat(1.0 - dst.w),
        BlendFactor::ConstantColor => constant,
        BlendFactor::OneMinusConstantColor => Vec4::ONE - constant,
        BlendFactor::ConstantAlpha => Vec4::splat(constant.w),
        BlendFactor::OneMinusConstantAlpha => Vec4::splat(1.0 - constant.w),
        BlendFactor::SrcAlphaSaturate => {
            let f = src.w.min(1.0 - dst.w);
            Vec4::new(f, f, f, 1.0)
        }
    }
}

fn combine(op: BlendOp, src: Vec4, sf: Vec4, dst: Vec4, df: Vec4) -> Vec4 {
    match op {
        BlendOp::Add => src * sf + dst * df,
        BlendOp::Subtract => src * sf - dst * df,
        BlendOp::ReverseSubtract => dst * df - src * sf,
        BlendOp::Min => src.min(dst),
        BlendOp::Max => src.max(dst),
    }
}

fn blend_values(blend: &ColorBlendAttachment, src: Vec4, dst: Vec4, constant: Vec4) -> Vec4 {
    let color = combine(
        blend.color_blend_op,
        src,
        factor(blend.src_color_blend_factor, src, dst, constant),
        dst,
        factor(blend.dst_color_blend_factor, src, dst, constant),
    );
    let alpha = combine(
        blend.alpha_blend_op,
        src,
        factor(blend.src_alpha_blend_factor, src, dst, constant),
        dst,
        factor(blend.dst_alpha_blend_factor, src, dst, constant),
    );
    color.truncate().extend(alpha.w)
}

fn apply_write_mask(new: Texel, old: Texel, mask: ColorComponentFlags) -> Texel {
    let keep = [
        mask.contains(ColorComponentFlags::R),
        mask.contains(ColorComponentFlags::G),
        mask.contains(ColorComponentFlags::B),
        mask.contains(ColorComponentFlags::A),
    ];
    match new.class() {
        TexelClass::Float => {
            let (n, o) = (new.to_vec4().to_array(), old.to_vec4().to_array());
            Texel::Float(Vec4::from_array(std::array::from_fn(|i| {
                if keep[i] {
                    n[i]
                } else {
                    o[i]
                }
            })))
        }
        TexelClass::Uint => {
            let (n, o) = (new.to_uvec4().to_array(), old.to_uvec4().to_array());
            Texel::Uint(std::array::from_fn(|i| if keep[i] { n[i] } else { o[i] }).into())
        }
        TexelClass::Sint => {
            let (n, o) = (new.to_ivec4().to_array(), old.to_ivec4().to_array());
            Texel::Sint(std::array::from_fn(|i| if keep[i] { n[i] } else { o[i] }).into())
        }
    }
}
