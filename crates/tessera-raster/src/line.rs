//! Line rasterization.
//!
//! Lines step along their major axis one pixel at a time and cover the
//! pixel containing each sample. The last endpoint is not drawn, so strips
//! touch each shared vertex once.

use crate::error::Result;
use crate::shader::Value;
use crate::triangle::{EmitFn, Fragment, ScreenVertex, VaryingSetup};
use tessera_core::Rect2D;

pub(crate) fn rasterize_line(
    a: &ScreenVertex,
    b: &ScreenVertex,
    bounds: Rect2D,
    setup: VaryingSetup<'_>,
    emit: &mut EmitFn<'_>,
) -> Result<u64> {
    let delta = b.position - a.position;
    let steps = delta.x.abs().max(delta.y.abs()).round();
    if steps.is_nan() || steps < 1.0 {
        return Ok(0);
    }
    let count = steps as u64;

    let mut fragment = Fragment {
        front_facing: true,
        ..Fragment::default()
    };
    let mut emitted = 0;

    for i in 0..count {
        let t = i as f32 / steps;
        let pos = a.position + delta * t;
        let (px, py) = (pos.x.floor() as i64, pos.y.floor() as i64);
        if !bounds.contains(px, py) {
            continue;
        }

        let pa = (1.0 - t) * a.inv_w;
        let pb = t * b.inv_w;
        let inv_w = pa + pb;
        let lambda = if inv_w > 0.0 { pb / inv_w } else { t };

        fragment.x = px as u32;
        fragment.y = py as u32;
        fragment.depth = a.z + (b.z - a.z) * t;
        fragment.inv_w = inv_w;
        setup.fill(&mut fragment.varyings, |j| {
            Value::lerp(a.varyings[j], b.varyings[j], lambda)
        });

        emit(&fragment)?;
        emitted += 1;
    }
    Ok(emitted)
}
