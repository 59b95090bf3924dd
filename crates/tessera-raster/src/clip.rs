//! Homogeneous clipping against the view volume.
//!
//! The volume is `-w <= x <= w`, `-w <= y <= w` and `0 <= z <= w`. Under
//! depth clamp the z planes are replaced by `w > 0`. Intersections are always
//! computed from the inside vertex toward the outside one, so an edge shared
//! by two primitives is cut at bit-identical points.

use crate::shader::Value;
use glam::Vec4;

/// Smallest `w` kept when the z planes are disabled.
const MIN_W: f32 = 1.0e-6;

/// A vertex in clip space with its varyings.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClipVertex {
    pub position: Vec4,
    pub point_size: f32,
    pub varyings: Vec<Value>,
}

impl ClipVertex {
    fn toward(inside: &Self, outside: &Self, t: f32) -> Self {
        Self {
            position: inside.position + (outside.position - inside.position) * t,
            point_size: inside.point_size + (outside.point_size - inside.point_size) * t,
            varyings: inside
                .varyings
                .iter()
                .zip(&outside.varyings)
                .map(|(&a, &b)| Value::lerp(a, b, t))
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Plane {
    Left,
    Right,
    Bottom,
    Top,
    Near,
    Far,
    PositiveW,
}

impl Plane {
    fn distance(self, p: Vec4) -> f32 {
        match self {
            Self::Left => p.w + p.x,
            Self::Right => p.w - p.x,
            Self::Bottom => p.w + p.y,
            Self::Top => p.w - p.y,
            Self::Near => p.z,
            Self::Far => p.w - p.z,
            Self::PositiveW => p.w - MIN_W,
        }
    }
}

fn planes(depth_clamp: bool) -> &'static [Plane] {
    const CLIPPED: [Plane; 6] = [
        Plane::Left,
        Plane::Right,
        Plane::Bottom,
        Plane::Top,
        Plane::Near,
        Plane::Far,
    ];
    const CLAMPED: [Plane; 5] = [
        Plane::PositiveW,
        Plane::Left,
        Plane::Right,
        Plane::Bottom,
        Plane::Top,
    ];
    if depth_clamp {
        &CLAMPED
    } else {
        &CLIPPED
    }
}

/// Bit set of the planes a position lies outside of.
pub(crate) fn outcode(p: Vec4, depth_clamp: bool) -> u8 {
    planes(depth_clamp)
        .iter()
        .enumerate()
        .fold(0, |code, (bit, plane)| {
            if plane.distance(p) < 0.0 {
                code | (1 << bit)
            } else {
                code
            }
        })
}

/// Result of classifying a primitive against the view volume.
pub(crate) enum Classification {
    Inside,
    Outside,
    Straddling,
}

pub(crate) fn classify(positions: &[Vec4], depth_clamp: bool) -> Classification {
    let mut all = u8::MAX;
    let mut any = 0;
    for &p in positions {
        let code = outcode(p, depth_clamp);
        all &= code;
        any |= code;
    }
    if all != 0 {
        Classification::Outside
    } else if any == 0 {
        Classification::Inside
    } else {
        Classification::Straddling
    }
}

/// Sutherland-Hodgman clip of a convex polygon. Returns fewer than three
/// vertices when nothing is left.
pub(crate) fn clip_polygon(mut polygon: Vec<ClipVertex>, depth_clamp: bool) -> Vec<ClipVertex> {
    for &plane in planes(depth_clamp) {
        if polygon.len() < 3 {
            break;
        }
        let mut next = Vec::with_capacity(polygon.len() + 1);
        for i in 0..polygon.len() {
            let current = &polygon[i];
            let following = &polygon[(i + 1) % polygon.len()];
            let dc = plane.distance(current.position);
            let df = plane.distance(following.position);

            if dc >= 0.0 {
                next.push(current.clone());
                if df < 0.0 {
                    next.push(ClipVertex::toward(current, following, dc / (dc - df)));
                }
            } else if df >= 0.0 {
                next.push(ClipVertex::toward(following, current, df / (df - dc)));
            }
        }
        polygon = next;
    }
    polygon
}

/// Clip a line segment. Returns `None` when nothing is left.
pub(crate) fn clip_line(
    a: &ClipVertex,
    b: &ClipVertex,
    depth_clamp: bool,
) -> Option<(ClipVertex, ClipVertex)> {
    let mut a = a.clone();
    let mut b = b.clone();
    for &plane in planes(depth_clamp) {
        let da = plane.distance(a.position);
        let db = plane.distance(b.position);
        match (da >= 0.0, db >= 0.0) {
            (true, true) => {}
            (false, false) => return None,
            (true, false) => b = ClipVertex::toward(&a, &b, da / (da - db)),
            (false, true) => a = ClipVertex::toward(&b, &a, db / (db - da)),
        }
    }
    Some((a, b))
}
