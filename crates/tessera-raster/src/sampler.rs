//! Texture filtering and addressing.

use crate::error::Result;
use crate::surface::Surface;
use glam::{Vec2, Vec4};
use tessera_core::format::TexelClass;
use tessera_core::Texel;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BorderColor {
    #[default]
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

impl BorderColor {
    fn texel(self, class: TexelClass) -> Texel {
        let v = match self {
            Self::TransparentBlack => Vec4::ZERO,
            Self::OpaqueBlack => Vec4::new(0.0, 0.0, 0.0, 1.0),
            Self::OpaqueWhite => Vec4::ONE,
        };
        match class {
            TexelClass::Float => Texel::Float(v),
            TexelClass::Uint => Texel::Uint(v.as_uvec4()),
            TexelClass::Sint => Texel::Sint(v.as_ivec4()),
        }
    }
}

/// Immutable sampler configuration.
///
/// Textures are sampled at their base level only, so the magnification
/// filter decides between nearest and bilinear filtering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerState {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub border_color: BorderColor,
}

/// Resolve an integer coordinate against `size`; `None` selects the border.
fn wrap(coord: i64, size: u32, mode: AddressMode) -> Option<u32> {
    let size = i64::from(size);
    let resolved = match mode {
        AddressMode::Repeat => coord.rem_euclid(size),
        AddressMode::MirroredRepeat => {
            let m = coord.rem_euclid(2 * size);
            if m >= size {
                2 * size - 1 - m
            } else {
                m
            }
        }
        AddressMode::ClampToEdge => coord.clamp(0, size - 1),
        AddressMode::ClampToBorder => {
            if coord < 0 || coord >= size {
                return None;
            }
            coord
        }
    };
    Some(resolved as u32)
}

impl SamplerState {
    /// Sampler with one filter and one address mode on both axes.
    pub const fn new(filter: Filter, address_mode: AddressMode) -> Self {
        Self {
            mag_filter: filter,
            min_filter: filter,
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            border_color: BorderColor::TransparentBlack,
        }
    }

    /// Read the texel at integer coordinates after addressing.
    pub fn fetch(&self, surface: &Surface, x: i32, y: i32) -> Result<Texel> {
        let x = wrap(i64::from(x), surface.width(), self.address_mode_u);
        let y = wrap(i64::from(y), surface.height(), self.address_mode_v);
        match (x, y) {
            (Some(x), Some(y)) => surface.read(x, y),
            _ => Ok(self.border_color.texel(surface.format().class())),
        }
    }

    /// Sample at normalized coordinates.
    ///
    /// Integer formats are never filtered.
    pub fn sample(&self, surface: &Surface, uv: Vec2) -> Result<Texel> {
        let size = Vec2::new(surface.width() as f32, surface.height() as f32);
        let linear =
            self.mag_filter == Filter::Linear && surface.format().class() == TexelClass::Float;

        if !linear {
            let p = (uv * size).floor();
            return self.fetch(surface, p.x as i32, p.y as i32);
        }

        let p = uv * size - Vec2::splat(0.5);
        let base = p.floor();
        let frac = p - base;
        let (x0, y0) = (base.x as i32, base.y as i32);

        let t00 = self.fetch(surface, x0, y0)?.to_vec4();
        let t10 = self.fetch(surface, x0 + 1, y0)?.to_vec4();
        let t01 = self.fetch(surface, x0, y0 + 1)?.to_vec4();
        let t11 = self.fetch(surface, x0 + 1, y0 + 1)?.to_vec4();

        let top = t00.lerp(t10, frac.x);
        let bottom = t01.lerp(t11, frac.x);
        Ok(Texel::Float(top.lerp(bottom, frac.y)))
    }
}
