//! Triangle setup and coverage.
//!
//! Coverage uses integer edge functions over vertices snapped to the
//! sub-pixel grid, sampled at pixel centers. Pixels exactly on an edge belong
//! to the triangle only when the edge is a top or left edge, so two triangles
//! sharing an edge cover every pixel along it exactly once.

use crate::error::Result;
use crate::shader::Value;
use glam::Vec2;
use tessera_core::math::{edge_function, is_top_left, FixedPoint, SUBPIXEL_HALF, SUBPIXEL_ONE};
use tessera_core::Rect2D;

/// A vertex after the viewport transform.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ScreenVertex {
    pub fixed: FixedPoint,
    pub position: Vec2,
    pub z: f32,
    pub inv_w: f32,
    pub point_size: f32,
    pub varyings: Vec<Value>,
}

/// A covered pixel with its interpolated attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Fragment {
    pub x: u32,
    pub y: u32,
    pub depth: f32,
    pub inv_w: f32,
    pub front_facing: bool,
    pub varyings: Vec<Value>,
}

/// Per-primitive varying setup shared by every rasterizer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct VaryingSetup<'a> {
    /// Flat flag per varying
    pub flat: &'a [bool],
    /// Varyings of the provoking vertex, used for flat slots
    pub provoking: &'a [Value],
}

impl VaryingSetup<'_> {
    pub fn fill(&self, out: &mut Vec<Value>, mut smooth: impl FnMut(usize) -> Value) {
        out.clear();
        out.extend(self.flat.iter().enumerate().map(|(i, &flat)| {
            if flat {
                self.provoking[i]
            } else {
                smooth(i)
            }
        }));
    }
}

pub(crate) type EmitFn<'e> = dyn FnMut(&Fragment) -> Result<()> + 'e;

/// Inclusive-exclusive pixel range whose centers may fall in `[lo, hi]`
/// (sub-pixel units), clipped to `[min, max)`.
pub(crate) fn pixel_span(lo: i64, hi: i64, min: i64, max: i64) -> (i64, i64) {
    let first = (lo - SUBPIXEL_HALF).div_euclid(SUBPIXEL_ONE).max(min);
    let end = ((hi - SUBPIXEL_HALF).div_euclid(SUBPIXEL_ONE) + 1).min(max);
    (first, end)
}

/// Twice the signed area of a snapped polygon. Positive is clockwise on screen.
pub(crate) fn polygon_area(vertices: &[ScreenVertex]) -> i64 {
    let Some(first) = vertices.first() else {
        return 0;
    };
    vertices
        .windows(2)
        .skip(1)
        .map(|w| edge_function(first.fixed, w[0].fixed, w[1].fixed))
        .sum()
}

/// Rasterize one triangle into `bounds`, calling `emit` for each covered
/// pixel in row-major order. Returns the number of fragments emitted.
pub(crate) fn rasterize_triangle(
    vertices: [&ScreenVertex; 3],
    bounds: Rect2D,
    front_facing: bool,
    setup: VaryingSetup<'_>,
    emit: &mut EmitFn<'_>,
) -> Result<u64> {
    let [v0, mut v1, mut v2] = vertices;
    let mut area = edge_function(v0.fixed, v1.fixed, v2.fixed);
    if area == 0 {
        return Ok(0);
    }
    if area < 0 {
        std::mem::swap(&mut v1, &mut v2);
        area = -area;
    }

    let bias = |a: &ScreenVertex, b: &ScreenVertex| i64::from(!is_top_left(a.fixed, b.fixed));
    let bias0 = bias(v1, v2);
    let bias1 = bias(v2, v0);
    let bias2 = bias(v0, v1);

    let xs = [v0.fixed.x, v1.fixed.x, v2.fixed.x];
    let ys = [v0.fixed.y, v1.fixed.y, v2.fixed.y];
    let (x_start, x_end) = pixel_span(
        xs.iter().copied().min().unwrap_or(0),
        xs.iter().copied().max().unwrap_or(0),
        i64::from(bounds.offset.x),
        bounds.right(),
    );
    let (y_start, y_end) = pixel_span(
        ys.iter().copied().min().unwrap_or(0),
        ys.iter().copied().max().unwrap_or(0),
        i64::from(bounds.offset.y),
        bounds.bottom(),
    );

    let inv_area = 1.0 / area as f64;
    let mut fragment = Fragment {
        front_facing,
        ..Fragment::default()
    };
    let mut emitted = 0;

    for py in y_start..y_end {
        for px in x_start..x_end {
            let p = FixedPoint::pixel_center(px, py);
            let e0 = edge_function(v1.fixed, v2.fixed, p);
            let e1 = edge_function(v2.fixed, v0.fixed, p);
            let e2 = edge_function(v0.fixed, v1.fixed, p);
            if e0 - bias0 < 0 || e1 - bias1 < 0 || e2 - bias2 < 0 {
                continue;
            }

            let b = [
                (e0 as f64 * inv_area) as f32,
                (e1 as f64 * inv_area) as f32,
                (e2 as f64 * inv_area) as f32,
            ];
            let persp = [b[0] * v0.inv_w, b[1] * v1.inv_w, b[2] * v2.inv_w];
            let inv_w = persp[0] + persp[1] + persp[2];
            let lambda = if inv_w > 0.0 {
                [persp[0] / inv_w, persp[1] / inv_w, persp[2] / inv_w]
            } else {
                b
            };

            fragment.x = px as u32;
            fragment.y = py as u32;
            fragment.depth = b[0] * v0.z + b[1] * v1.z + b[2] * v2.z;
            fragment.inv_w = inv_w;
            setup.fill(&mut fragment.varyings, |i| {
                Value::weighted([v0.varyings[i], v1.varyings[i], v2.varyings[i]], lambda)
            });

            emit(&fragment)?;
            emitted += 1;
        }
    }
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vertex(x: f32, y: f32, value: f32) -> ScreenVertex {
        ScreenVertex {
            fixed: FixedPoint::snap(x, y),
            position: Vec2::new(x, y),
            z: 0.5,
            inv_w: 1.0,
            point_size: 1.0,
            varyings: vec![Value::Float(value)],
        }
    }

    fn covered(vertices: [&ScreenVertex; 3], bounds: Rect2D) -> Vec<(u32, u32)> {
        let provoking = vertices[0].varyings.clone();
        let setup = VaryingSetup {
            flat: &[false],
            provoking: &provoking,
        };
        let mut pixels = Vec::new();
        rasterize_triangle(vertices, bounds, true, setup, &mut |f: &Fragment| {
            pixels.push((f.x, f.y));
            Ok(())
        })
        .unwrap();
        pixels
    }

    #[test]
    fn shared_edge_is_covered_once() {
        let bounds = Rect2D::new(0, 0, 8, 8);
        let a = vertex(0.0, 0.0, 0.0);
        let b = vertex(8.0, 0.0, 0.0);
        let c = vertex(8.0, 8.0, 0.0);
        let d = vertex(0.0, 8.0, 0.0);

        let mut counts = [[0u32; 8]; 8];
        for (x, y) in covered([&a, &b, &c], bounds)
            .into_iter()
            .chain(covered([&a, &c, &d], bounds))
        {
            counts[y as usize][x as usize] += 1;
        }
        assert!(counts.iter().flatten().all(|&n| n == 1));
    }

    #[test]
    fn winding_does_not_change_coverage() {
        let bounds = Rect2D::new(0, 0, 16, 16);
        let a = vertex(1.3, 2.1, 0.0);
        let b = vertex(13.7, 4.9, 0.0);
        let c = vertex(6.2, 14.4, 0.0);

        let mut forward = covered([&a, &b, &c], bounds);
        let mut backward = covered([&a, &c, &b], bounds);
        forward.sort_unstable();
        backward.sort_unstable();
        assert!(!forward.is_empty());
        assert_eq!(forward, backward);
    }

    #[test]
    fn degenerate_triangle_emits_nothing() {
        let a = vertex(0.0, 0.0, 0.0);
        let b = vertex(4.0, 4.0, 0.0);
        let c = vertex(8.0, 8.0, 0.0);
        assert!(covered([&a, &b, &c], Rect2D::new(0, 0, 8, 8)).is_empty());
    }

    #[test]
    fn bounds_limit_coverage() {
        let a = vertex(-10.0, -10.0, 0.0);
        let b = vertex(30.0, -10.0, 0.0);
        let c = vertex(-10.0, 30.0, 0.0);
        let pixels = covered([&a, &b, &c], Rect2D::new(2, 3, 4, 2));
        assert_eq!(pixels.len(), 8);
        assert!(pixels.iter().all(|&(x, y)| (2..6).contains(&x) && (3..5).contains(&y)));
    }

    #[test]
    fn varyings_interpolate_linearly_without_perspective() {
        let a = vertex(0.0, 0.0, 0.0);
        let b = vertex(16.0, 0.0, 16.0);
        let c = vertex(0.0, 16.0, 0.0);
        let provoking = a.varyings.clone();
        let setup = VaryingSetup {
            flat: &[false],
            provoking: &provoking,
        };
        let mut seen = Vec::new();
        rasterize_triangle([&a, &b, &c], Rect2D::new(0, 0, 16, 16), true, setup, &mut |f: &Fragment| {
            seen.push((f.x, f.varyings[0].as_f32()));
            Ok(())
        })
        .unwrap();

        for (x, value) in seen {
            assert_relative_eq!(value, x as f32 + 0.5, epsilon = 1e-4);
        }
    }

    #[test]
    fn flat_varyings_come_from_the_provoking_vertex() {
        let a = vertex(0.0, 0.0, 1.0);
        let b = vertex(8.0, 0.0, 2.0);
        let c = vertex(0.0, 8.0, 3.0);
        let provoking = a.varyings.clone();
        let setup = VaryingSetup {
            flat: &[true],
            provoking: &provoking,
        };
        rasterize_triangle([&a, &b, &c], Rect2D::new(0, 0, 8, 8), true, setup, &mut |f: &Fragment| {
            assert_eq!(f.varyings[0], Value::Float(1.0));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn area_sign_follows_screen_winding() {
        let a = vertex(0.0, 0.0, 0.0);
        let b = vertex(4.0, 0.0, 0.0);
        let c = vertex(0.0, 4.0, 0.0);
        assert!(polygon_area(&[a.clone(), b.clone(), c.clone()]) > 0);
        assert!(polygon_area(&[a, c, b]) < 0);
    }
}
