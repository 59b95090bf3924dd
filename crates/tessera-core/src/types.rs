//! Geometry, comparison and clear-value types.

use crate::format::Texel;
use bitflags::bitflags;
use glam::{IVec4, UVec4, Vec4};
use serde::{Deserialize, Serialize};

/// Two-dimensional size in texels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of texels covered.
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Three-dimensional size in texels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Size of the given mip level. Each dimension bottoms out at one.
    pub const fn mip(self, level: u32) -> Self {
        const fn shrink(v: u32, level: u32) -> u32 {
            let s = if level >= 32 { 0 } else { v >> level };
            if s == 0 {
                1
            } else {
                s
            }
        }
        Self {
            width: shrink(self.width, level),
            height: shrink(self.height, level),
            depth: shrink(self.depth, level),
        }
    }

    pub const fn texel_count(self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    pub const fn to_2d(self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }
}

/// Signed two-dimensional offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset2D {
    pub x: i32,
    pub y: i32,
}

impl Offset2D {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Signed three-dimensional offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Offset3D {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Axis-aligned rectangle in framebuffer space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect2D {
    pub offset: Offset2D,
    pub extent: Extent2D,
}

impl Rect2D {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            offset: Offset2D::new(x, y),
            extent: Extent2D::new(width, height),
        }
    }

    /// Rectangle anchored at the origin.
    pub const fn from_extent(extent: Extent2D) -> Self {
        Self {
            offset: Offset2D::new(0, 0),
            extent,
        }
    }

    /// Exclusive right edge.
    pub const fn right(self) -> i64 {
        self.offset.x as i64 + self.extent.width as i64
    }

    /// Exclusive bottom edge.
    pub const fn bottom(self) -> i64 {
        self.offset.y as i64 + self.extent.height as i64
    }

    pub const fn is_empty(self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }

    /// Overlap of two rectangles; empty when they do not intersect.
    pub fn intersect(self, other: Self) -> Self {
        let left = i64::from(self.offset.x).max(i64::from(other.offset.x));
        let top = i64::from(self.offset.y).max(i64::from(other.offset.y));
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return Self::new(left as i32, top as i32, 0, 0);
        }
        Self::new(
            left as i32,
            top as i32,
            (right - left) as u32,
            (bottom - top) as u32,
        )
    }

    pub fn contains(self, x: i64, y: i64) -> bool {
        x >= i64::from(self.offset.x)
            && x < self.right()
            && y >= i64::from(self.offset.y)
            && y < self.bottom()
    }

    /// Whether `other` lies completely inside this rectangle.
    pub fn encloses(self, other: Self) -> bool {
        other.offset.x >= self.offset.x
            && other.offset.y >= self.offset.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Viewport transform from normalized device coordinates to framebuffer space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

impl Viewport {
    /// Whether the size is at most `max_dimension` and every edge lies in
    /// `bounds`. Non-finite values never fit.
    pub fn fits(&self, max_dimension: u32, bounds: [f32; 2]) -> bool {
        let max = max_dimension as f32;
        let within = |v: f32| v >= bounds[0] && v <= bounds[1];
        self.width.abs() <= max
            && self.height.abs() <= max
            && within(self.x)
            && within(self.x + self.width)
            && within(self.y)
            && within(self.y + self.height)
    }

    /// Viewport covering the given extent with depth range `[0, 1]`.
    pub fn from_extent(extent: Extent2D) -> Self {
        Self {
            width: extent.width as f32,
            height: extent.height as f32,
            ..Self::default()
        }
    }
}

/// Comparison operator for depth and stencil tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    /// Evaluate `reference OP stored`.
    #[inline]
    pub fn test<T: PartialOrd>(self, reference: T, stored: T) -> bool {
        match self {
            Self::Never => false,
            Self::Less => reference < stored,
            Self::Equal => reference == stored,
            Self::LessOrEqual => reference <= stored,
            Self::Greater => reference > stored,
            Self::NotEqual => reference != stored,
            Self::GreaterOrEqual => reference >= stored,
            Self::Always => true,
        }
    }
}

bitflags! {
    /// Image aspects addressed by a subresource range or a copy.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ImageAspectFlags: u32 {
        const COLOR = 0x1;
        const DEPTH = 0x2;
        const STENCIL = 0x4;
    }
}

/// Clear value for color attachments and images.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClearColorValue {
    Float([f32; 4]),
    Uint([u32; 4]),
    Int([i32; 4]),
}

impl Default for ClearColorValue {
    fn default() -> Self {
        Self::Float([0.0; 4])
    }
}

impl From<ClearColorValue> for Texel {
    fn from(value: ClearColorValue) -> Self {
        match value {
            ClearColorValue::Float(v) => Self::Float(Vec4::from_array(v)),
            ClearColorValue::Uint(v) => Self::Uint(UVec4::from_array(v)),
            ClearColorValue::Int(v) => Self::Sint(IVec4::from_array(v)),
        }
    }
}

/// Clear value for depth/stencil attachments and images.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClearDepthStencilValue {
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearDepthStencilValue {
    fn default() -> Self {
        Self {
            depth: 1.0,
            stencil: 0,
        }
    }
}

/// Clear value of a rendering attachment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClearValue {
    Color(ClearColorValue),
    DepthStencil(ClearDepthStencilValue),
}

impl Default for ClearValue {
    fn default() -> Self {
        Self::Color(ClearColorValue::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_extent_bottoms_out_at_one() {
        let extent = Extent3D::new(16, 4, 1);
        assert_eq!(extent.mip(1), Extent3D::new(8, 2, 1));
        assert_eq!(extent.mip(3), Extent3D::new(2, 1, 1));
        assert_eq!(extent.mip(40), Extent3D::new(1, 1, 1));
    }

    #[test]
    fn rect_intersection() {
        let a = Rect2D::new(0, 0, 10, 10);
        let b = Rect2D::new(5, -3, 10, 6);
        assert_eq!(a.intersect(b), Rect2D::new(5, 0, 5, 3));
        assert!(a.intersect(Rect2D::new(20, 20, 4, 4)).is_empty());
        assert!(a.contains(9, 9));
        assert!(!a.contains(10, 9));
    }

    #[test]
    fn compare_op_semantics() {
        assert!(CompareOp::Less.test(0.2, 0.8));
        assert!(!CompareOp::Less.test(0.8, 0.2));
        assert!(!CompareOp::Less.test(0.5, 0.5));
        assert!(CompareOp::LessOrEqual.test(0.5, 0.5));
        assert!(CompareOp::Always.test(1, 0));
        assert!(!CompareOp::Never.test(0, 1));
    }

    #[test]
    fn viewport_limits() {
        use crate::constants::{MAX_VIEWPORT_DIMENSION, VIEWPORT_BOUNDS_RANGE};
        let fits = |vp: Viewport| vp.fits(MAX_VIEWPORT_DIMENSION, VIEWPORT_BOUNDS_RANGE);

        let square = Viewport::from_extent(Extent2D::new(64, 64));
        assert!(fits(square));
        assert!(fits(Viewport::from_extent(Extent2D::new(32768, 32768))));
        assert!(fits(Viewport { y: 64.0, height: -64.0, ..square }));
        assert!(!fits(Viewport::from_extent(Extent2D::new(32769, 1))));
        assert!(!fits(Viewport { x: -5e7, y: -5e7, width: 1e8, height: 1e8, ..square }));
        assert!(!fits(Viewport { x: 65000.0, width: 1000.0, ..square }));
        assert!(!fits(Viewport { width: f32::NAN, ..square }));
    }
}
