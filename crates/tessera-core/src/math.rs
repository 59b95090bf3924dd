//! Fixed-point and alignment helpers.

use crate::constants::SUBPIXEL_BITS;

/// One pixel in sub-pixel units.
pub const SUBPIXEL_ONE: i64 = 1 << SUBPIXEL_BITS;

/// Half a pixel in sub-pixel units (pixel centers sit here).
pub const SUBPIXEL_HALF: i64 = SUBPIXEL_ONE / 2;

/// Screen-space point snapped to the sub-pixel grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FixedPoint {
    pub x: i64,
    pub y: i64,
}

impl FixedPoint {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Snap a floating-point screen position, rounding to nearest.
    pub fn snap(x: f32, y: f32) -> Self {
        Self {
            x: to_fixed(x),
            y: to_fixed(y),
        }
    }

    /// Center of the pixel `(px, py)`.
    pub const fn pixel_center(px: i64, py: i64) -> Self {
        Self {
            x: px * SUBPIXEL_ONE + SUBPIXEL_HALF,
            y: py * SUBPIXEL_ONE + SUBPIXEL_HALF,
        }
    }
}

/// Convert to fixed point with [`SUBPIXEL_BITS`] fractional bits.
#[inline]
pub fn to_fixed(v: f32) -> i64 {
    (f64::from(v) * SUBPIXEL_ONE as f64).round() as i64
}

/// Edge function of the directed edge `a -> b` evaluated at `p`.
///
/// With y pointing down, the value is positive when `p` lies to the right of
/// the edge as drawn on screen, and twice the signed area of `(a, b, p)`.
#[inline]
pub const fn edge_function(a: FixedPoint, b: FixedPoint, p: FixedPoint) -> i64 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Whether `a -> b` is a top or left edge of a positively oriented triangle.
///
/// A top edge is horizontal with the interior below it; a left edge has the
/// interior to its right, which for this orientation means it points up.
#[inline]
pub const fn is_top_left(a: FixedPoint, b: FixedPoint) -> bool {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    (dy == 0 && dx > 0) || dy < 0
}

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
