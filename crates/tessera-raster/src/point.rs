//! Point rasterization.

use crate::error::Result;
use crate::triangle::{EmitFn, Fragment, ScreenVertex, VaryingSetup};
use tessera_core::Rect2D;

/// Largest point size honored; bigger sizes are clamped.
pub(crate) const MAX_POINT_SIZE: f32 = 64.0;

/// Cover every pixel whose center lies in the square of side `point_size`
/// centered on the vertex.
pub(crate) fn rasterize_point(
    v: &ScreenVertex,
    bounds: Rect2D,
    setup: VaryingSetup<'_>,
    emit: &mut EmitFn<'_>,
) -> Result<u64> {
    let size = if v.point_size.is_nan() {
        1.0
    } else {
        v.point_size.clamp(1.0, MAX_POINT_SIZE)
    };
    let half = size * 0.5;
    let span = |center: f32, min: i64, max: i64| {
        let first = ((center - half - 0.5).ceil() as i64).max(min);
        let end = ((center + half - 0.5).ceil() as i64).min(max);
        first..end
    };
    let xs = span(v.position.x, i64::from(bounds.offset.x), bounds.right());
    let ys = span(v.position.y, i64::from(bounds.offset.y), bounds.bottom());

    let mut fragment = Fragment {
        depth: v.z,
        inv_w: v.inv_w,
        front_facing: true,
        ..Fragment::default()
    };
    setup.fill(&mut fragment.varyings, |i| v.varyings[i]);

    let mut emitted = 0;
    for py in ys {
        for px in xs.clone() {
            fragment.x = px as u32;
            fragment.y = py as u32;
            emit(&fragment)?;
            emitted += 1;
        }
    }
    Ok(emitted)
}
