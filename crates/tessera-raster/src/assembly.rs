//! Primitive assembly.

use crate::state::PrimitiveTopology;

/// A primitive as indices into the shaded vertex list. The first vertex
/// is the provoking vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Primitive {
    Point(usize),
    Line([usize; 2]),
    Triangle([usize; 3]),
}

/// Group a vertex stream into primitives. `None` entries are restart
/// markers that end the current strip or fan.
pub(crate) fn assemble(topology: PrimitiveTopology, stream: &[Option<usize>]) -> Vec<Primitive> {
    let mut primitives = Vec::new();
    for run in stream.split(Option::is_none) {
        let run: Vec<usize> = run.iter().flatten().copied().collect();
        assemble_run(topology, &run, &mut primitives);
    }
    primitives
}

fn assemble_run(topology: PrimitiveTopology, v: &[usize], out: &mut Vec<Primitive>) {
    match topology {
        PrimitiveTopology::PointList => out.extend(v.iter().map(|&i| Primitive::Point(i))),
        PrimitiveTopology::LineList => {
            out.extend(v.chunks_exact(2).map(|c| Primitive::Line([c[0], c[1]])));
        }
        PrimitiveTopology::LineStrip => {
            out.extend(v.windows(2).map(|w| Primitive::Line([w[0], w[1]])));
        }
        PrimitiveTopology::TriangleList => {
            out.extend(
                v.chunks_exact(3)
                    .map(|c| Primitive::Triangle([c[0], c[1], c[2]])),
            );
        }
        PrimitiveTopology::TriangleStrip => {
            // Odd triangles swap their last two vertices to keep the winding
            out.extend(v.windows(3).enumerate().map(|(i, w)| {
                if i % 2 == 0 {
                    Primitive::Triangle([w[0], w[1], w[2]])
                } else {
                    Primitive::Triangle([w[0], w[2], w[1]])
                }
            }));
        }
        PrimitiveTopology::TriangleFan => {
            if let Some((&center, rest)) = v.split_first() {
                out.extend(
                    rest.windows(2)
                        .map(|w| Primitive::Triangle([w[0], w[1], center])),
                );
            }
        }
    }
}
