//! The dense path: pack the padded charts into one tall surface per input
//! plane, run a plain 2D correlation against the expanded stencils, and
//! unpack.
//!
//! Stacking charts on top of each other is only sound because padding has
//! already resolved every neighbor a stencil can reach, so no output cell
//! that survives cropping reads across a chart boundary.

use std::thread;

use log::trace;

use crate::error::IcoError;
use crate::kernel::{tap_index, ExpandedKernel};
use crate::padding::PaddingIndexMap;
use crate::reconcile::{SeamCopies, SeamCopy};
use crate::tensor::{FeatureTensor, Shape};
use crate::topology::CHARTS;

/// A stack of 2D planes, `(planes, height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    planes: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Surface {
    /// Reinterprets a padded `(C, R, 5, H+2, W+2)` tensor as
    /// `(C*R, 5*(H+2), W+2)`. No data moves.
    pub fn pack(padded: FeatureTensor) -> Surface {
        let s = padded.shape();
        Surface {
            planes: s.channels * s.rotations,
            height: s.charts * s.rows,
            width: s.cols,
            data: padded.into_vec(),
        }
    }

    /// Splits the planes into `channels x rotations` and the rows into the
    /// five charts.
    pub fn unpack(self, channels: usize, rotations: usize) -> Result<FeatureTensor, IcoError> {
        if channels * rotations != self.planes || self.height % CHARTS != 0 {
            return Err(IcoError::ShapeMismatch {
                what: "surface unpack",
                expected: vec![channels * rotations, CHARTS],
                found: vec![self.planes, self.height],
            });
        }
        let shape = Shape {
            channels,
            rotations,
            charts: CHARTS,
            rows: self.height / CHARTS,
            cols: self.width,
        };
        FeatureTensor::from_vec(shape, self.data)
    }

    /// `(planes, height, width)`.
    pub fn dims(&self) -> [usize; 3] {
        [self.planes, self.height, self.width]
    }

    fn plane(&self, p: usize) -> &[f32] {
        let len = self.height * self.width;
        &self.data[p * len..][..len]
    }
}

/// Same-size 2D correlation with zeros outside the surface. Output planes
/// are independent and are spread over the available cores.
pub fn correlate(input: &Surface, kernel: &ExpandedKernel) -> Result<Surface, IcoError> {
    if input.planes != kernel.in_planes() {
        return Err(IcoError::ShapeMismatch {
            what: "correlation input planes",
            expected: vec![kernel.in_planes()],
            found: vec![input.planes],
        });
    }

    let out_planes = kernel.out_planes();
    let plane_len = input.height * input.width;
    let mut data = vec![0.0; out_planes * plane_len];

    if !data.is_empty() {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, out_planes);
        let per_worker = out_planes.div_ceil(workers);
        trace!(
            "correlating {} -> {} planes of {}x{} on {} threads",
            input.planes,
            out_planes,
            input.height,
            input.width,
            workers
        );

        thread::scope(|scope| {
            for (chunk_idx, chunk) in data.chunks_mut(per_worker * plane_len).enumerate() {
                scope.spawn(move || {
                    for (k, out) in chunk.chunks_mut(plane_len).enumerate() {
                        correlate_plane(input, kernel, chunk_idx * per_worker + k, out);
                    }
                });
            }
        });
    }

    Ok(Surface {
        planes: out_planes,
        height: input.height,
        width: input.width,
        data,
    })
}

fn correlate_plane(input: &Surface, kernel: &ExpandedKernel, o: usize, out: &mut [f32]) {
    let (h, w) = (input.height as isize, input.width as isize);
    out.fill(kernel.bias()[o]);

    for p in 0..input.planes {
        let src = input.plane(p);
        for (t, &weight) in kernel.stencil(o, p).iter().enumerate() {
            if weight == 0.0 {
                continue;
            }
            let (dy, dx) = ((t / 3) as isize - 1, (t % 3) as isize - 1);
            for y in 0.max(-dy)..h.min(h - dy) {
                let row_out = (y * w) as usize;
                let row_in = ((y + dy) * w) as usize;
                for x in 0.max(-dx)..w.min(w - dx) {
                    out[row_out + x as usize] += weight * src[row_in + (x + dx) as usize];
                }
            }
        }
    }
}

/// Pads nothing, packs, correlates, and unpacks: the padded `(Cin, Rin, 5,
/// H+2, W+2)` tensor becomes `(Cout, Rout, 5, H+2, W+2)`. Only the inner
/// `H x W` of each chart is meaningful.
pub fn convolve(padded: FeatureTensor, kernel: &ExpandedKernel) -> Result<FeatureTensor, IcoError> {
    let surface = Surface::pack(padded);
    correlate(&surface, kernel)?.unpack(kernel.out_channels(), kernel.out_rotations())
}

/// Computes the second copy of every cone vertex: the value its stencil
/// would produce reading the alternate source of its ambiguous cell.
///
/// `input` is the unpadded input and `cropped` the cropped convolution
/// output; only the ambiguous tap differs, so each copy is the canonical
/// value plus that tap's contribution to the difference.
pub fn seam_copies(
    padding: &PaddingIndexMap,
    input: &FeatureTensor,
    kernel: &ExpandedKernel,
    cropped: &FeatureTensor,
) -> Result<SeamCopies, IcoError> {
    let s_in = input.shape();
    let s_out = cropped.shape();
    if s_out.channels * s_out.rotations != kernel.out_planes() {
        return Err(IcoError::ShapeMismatch {
            what: "convolution output planes",
            expected: vec![kernel.out_planes()],
            found: vec![s_out.channels * s_out.rotations],
        });
    }
    let rout = kernel.out_rotations();
    let mut copies = SeamCopies::new(kernel.out_planes());

    for amb in padding.ambiguous() {
        let tap = tap_index(amb.offset);
        let deltas: Vec<f32> = (0..s_in.channels)
            .flat_map(|ci| (0..s_in.rotations).map(move |ri| (ci, ri)))
            .map(|(ci, ri)| amb.alternate.gather(input, ci, ri) - amb.canonical.gather(input, ci, ri))
            .collect();

        let mut canonical = Vec::with_capacity(kernel.out_planes());
        let mut alternate = Vec::with_capacity(kernel.out_planes());
        for o in 0..kernel.out_planes() {
            let (co, ro) = (o / rout, o % rout);
            let here = cropped.get(co, ro, amb.cone.chart, amb.cone.row, amb.cone.col);
            let shift: f32 = deltas
                .iter()
                .enumerate()
                .map(|(p, d)| kernel.stencil(o, p)[tap] * d)
                .sum();
            canonical.push(here);
            alternate.push(here + shift);
        }

        copies.record(
            amb.cone,
            SeamCopy {
                source: amb.canonical,
                canonical: true,
                values: canonical,
            },
        )?;
        copies.record(
            amb.cone,
            SeamCopy {
                source: amb.alternate,
                canonical: false,
                values: alternate,
            },
        )?;
    }

    Ok(copies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CompactKernel, TAPS};
    use crate::topology::GridTopology;
    use rand::distributions::{Distribution, Uniform};

    #[test]
    fn pack_and_unpack_keep_axes_apart() {
        let shape = Shape {
            channels: 2,
            rotations: 6,
            charts: 5,
            rows: 3,
            cols: 4,
        };
        let t = FeatureTensor::from_fn(shape, |c, r, k, i, j| {
            (c * 10000 + r * 1000 + k * 100 + i * 10 + j) as f32
        });
        let s = Surface::pack(t.clone());
        assert_eq!(s.dims(), [12, 15, 4]);
        assert_eq!(s.plane(7)[4 * 3 * 4 + 2 * 4 + 1], 11421.0);
        assert_eq!(s.unpack(2, 6).unwrap(), t);
    }

    #[test]
    fn unpack_rejects_bad_plane_split() {
        let t = FeatureTensor::zeros(Shape {
            channels: 1,
            rotations: 6,
            charts: 5,
            rows: 2,
            cols: 2,
        });
        assert!(Surface::pack(t).unpack(4, 1).is_err());
    }

    #[test]
    fn correlation_matches_direct_sum() {
        let mut rng = rand::thread_rng();
        let dist = Uniform::new(-1.0f32, 1.0);
        let shape = Shape {
            channels: 2,
            rotations: 1,
            charts: 5,
            rows: 4,
            cols: 6,
        };
        let x = FeatureTensor::from_fn(shape, |_, _, _, _, _| dist.sample(&mut rng));
        let k = CompactKernel::from_fn(3, 2, 1, vec![0.1, 0.2, 0.3], |_, _, _, _| {
            dist.sample(&mut rng)
        })
        .unwrap();
        let e = ExpandedKernel::expand(&k, 1).unwrap();
        let out = correlate(&Surface::pack(x.clone()), &e).unwrap();
        let [_, h, w] = out.dims();

        for o in 0..3 {
            for y in 0..h as isize {
                for xx in 0..w as isize {
                    let mut expected = e.bias()[o];
                    for p in 0..2 {
                        let src = Surface::pack(x.clone());
                        for t in 0..TAPS {
                            let (dy, dx) = ((t / 3) as isize - 1, (t % 3) as isize - 1);
                            let (sy, sx) = (y + dy, xx + dx);
                            if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                                continue;
                            }
                            expected += e.stencil(o, p)[t] * src.plane(p)[(sy * w as isize + sx) as usize];
                        }
                    }
                    let got = out.plane(o)[(y * w as isize + xx) as usize];
                    assert!((got - expected).abs() < 1e-5, "{} vs {}", got, expected);
                }
            }
        }
    }

    #[test]
    fn correlation_checks_planes() {
        let k = CompactKernel::new(1, 2, 1, vec![0.0; 14], vec![0.0]).unwrap();
        let e = ExpandedKernel::expand(&k, 1).unwrap();
        let x = FeatureTensor::zeros(Shape {
            channels: 1,
            rotations: 1,
            charts: 5,
            rows: 2,
            cols: 2,
        });
        assert!(matches!(
            correlate(&Surface::pack(x), &e),
            Err(IcoError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn zero_input_gives_bias() {
        let t = GridTopology::new(1).unwrap();
        let k = CompactKernel::new(2, 1, 1, vec![1.0; 14], vec![3.0, -2.0]).unwrap();
        let e = ExpandedKernel::expand(&k, 6).unwrap();
        let padded = FeatureTensor::zeros(Shape::on_grid(&t, 1, 1).padded());
        let out = convolve(padded, &e).unwrap();
        assert_eq!(out.shape().dims(), [2, 6, 5, 4, 6]);
        assert!(out.plane(0, 3).iter().all(|&v| v == 3.0));
        assert!(out.plane(1, 5).iter().all(|&v| v == -2.0));
    }

    #[test]
    fn seam_copies_cover_every_cone() {
        let t = GridTopology::new(2).unwrap();
        let map = PaddingIndexMap::new(&t).unwrap();
        let x = FeatureTensor::filled(Shape::on_grid(&t, 1, 1), 1.0);
        let k = CompactKernel::new(1, 1, 1, vec![1.0; 7], vec![0.0]).unwrap();
        let e = ExpandedKernel::expand(&k, 1).unwrap();
        let out = convolve(map.apply(&x).unwrap(), &e).unwrap().crop(1).unwrap();
        let copies = seam_copies(&map, &x, &e, &out).unwrap();
        assert_eq!(copies.len(), 10);
        // both readings are stored cells holding 1.0, so the copies agree
        for (_, list) in copies.iter() {
            assert_eq!(list.len(), 2);
            assert_eq!(list[0].values, list[1].values);
        }
    }
}
