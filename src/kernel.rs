//! Compact rotation-equivariant kernels and their 3x3 stencil expansion.
//!
//! A compact kernel stores one weight per `(out channel, in channel x in
//! rotation, slot)`. Slot 0 is the center, slots 1 to 6 walk the ring one
//! sixth-turn at a time starting from `(0,1)`; see [SLOT_OFFSETS]. The
//! expansion for output rotation `ro` turns the ring by `ro` slots and, for
//! rotated inputs, cycles the input rotations the other way:
//!
//! ```text
//! K[co, ro, ci, ri, offset(turn(s, ro))] = w[co, ci, (ri - ro) mod Rin, s]
//! ```
//!
//! Stencil taps are laid out row-major over offsets `-1..=1`, so the two
//! corners `(-1,1)` and `(1,-1)` that are not hexagonal neighbors stay zero.

use crate::error::IcoError;
use crate::padding::check_rotations;
use crate::topology::RING;

/// Neighbor slots per vertex, the center included.
pub const SLOTS: usize = 7;

/// Taps in one 3x3 stencil.
pub const TAPS: usize = 9;

/// Lattice offset of each slot, in `(row, col)`.
pub const SLOT_OFFSETS: [(isize, isize); SLOTS] = [
    (0, 0),
    (0, 1),
    (1, 1),
    (1, 0),
    (0, -1),
    (-1, -1),
    (-1, 0),
];

/// Turns a slot `steps` sixth-turns around the center.
#[inline]
pub fn turn_slot(slot: usize, steps: usize) -> usize {
    if slot == 0 {
        0
    } else {
        (slot - 1 + steps) % RING + 1
    }
}

/// Position of an offset inside a 3x3 stencil.
#[inline]
pub fn tap_index(offset: (isize, isize)) -> usize {
    ((offset.0 + 1) * 3 + offset.1 + 1) as usize
}

/// Which compact weight every stencil tap reads, as `(co, ci, ri, slot)`.
///
/// The table is shaped `(out channels, out rotations, in channels, in
/// rotations, 9, 4)`; taps that read nothing, the two corners, hold four
/// `-1`s. [ExpandedKernel::expand] is a gather through it, and it can be
/// shipped as is to hardware that expands weights itself.
pub fn expansion_indices(
    out_channels: usize,
    out_rotations: usize,
    in_channels: usize,
    in_rotations: usize,
) -> Result<Vec<i32>, IcoError> {
    check_rotations(out_rotations)?;
    check_rotations(in_rotations)?;
    let stencils = out_channels * out_rotations * in_channels * in_rotations;
    let mut index = vec![-1i32; stencils * TAPS * 4];

    for co in 0..out_channels {
        for ro in 0..out_rotations {
            for ci in 0..in_channels {
                for ri in 0..in_rotations {
                    let stencil = ((co * out_rotations + ro) * in_channels + ci) * in_rotations + ri;
                    let src_r = (ri + in_rotations - ro % in_rotations) % in_rotations;
                    for s in 0..SLOTS {
                        let tap = tap_index(SLOT_OFFSETS[turn_slot(s, ro)]);
                        let at = (stencil * TAPS + tap) * 4;
                        index[at..at + 4].copy_from_slice(&[co as i32, ci as i32, src_r as i32, s as i32]);
                    }
                }
            }
        }
    }
    Ok(index)
}

/// The weights and bias as handed in by the weight source.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactKernel {
    out_channels: usize,
    in_channels: usize,
    in_rotations: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl CompactKernel {
    /// Wraps `weights` of shape `(out, in x in_rotations, 7)` and `bias` of
    /// shape `(out)`.
    pub fn new(
        out_channels: usize,
        in_channels: usize,
        in_rotations: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
    ) -> Result<Self, IcoError> {
        check_rotations(in_rotations)?;
        let expected = out_channels * in_channels * in_rotations * SLOTS;
        if weights.len() != expected {
            return Err(IcoError::ShapeMismatch {
                what: "kernel weights",
                expected: vec![out_channels, in_channels * in_rotations, SLOTS],
                found: vec![weights.len()],
            });
        }
        if bias.len() != out_channels {
            return Err(IcoError::ShapeMismatch {
                what: "kernel bias",
                expected: vec![out_channels],
                found: vec![bias.len()],
            });
        }
        Ok(CompactKernel {
            out_channels,
            in_channels,
            in_rotations,
            weights,
            bias,
        })
    }

    /// Builds a kernel by evaluating `f(co, ci, ri, slot)`.
    pub fn from_fn(
        out_channels: usize,
        in_channels: usize,
        in_rotations: usize,
        bias: Vec<f32>,
        mut f: impl FnMut(usize, usize, usize, usize) -> f32,
    ) -> Result<Self, IcoError> {
        let mut weights = Vec::with_capacity(out_channels * in_channels * in_rotations * SLOTS);
        for co in 0..out_channels {
            for ci in 0..in_channels {
                for ri in 0..in_rotations {
                    for s in 0..SLOTS {
                        weights.push(f(co, ci, ri, s));
                    }
                }
            }
        }
        Self::new(out_channels, in_channels, in_rotations, weights, bias)
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Input channels.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Input rotations, 1 or 6.
    pub fn in_rotations(&self) -> usize {
        self.in_rotations
    }

    /// One weight.
    #[inline]
    pub fn weight(&self, co: usize, ci: usize, ri: usize, slot: usize) -> f32 {
        self.weights[((co * self.in_channels + ci) * self.in_rotations + ri) * SLOTS + slot]
    }

    /// The flat weights.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Per output channel bias.
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// The same kernel with every ring turned `steps` slots; the center
    /// weight stays put.
    pub fn turned(&self, steps: usize) -> CompactKernel {
        let mut weights = self.weights.clone();
        for (chunk, src) in weights.chunks_mut(SLOTS).zip(self.weights.chunks(SLOTS)) {
            for (s, w) in chunk.iter_mut().enumerate() {
                *w = src[turn_slot(s, steps)];
            }
        }
        CompactKernel {
            weights,
            ..self.clone()
        }
    }
}

/// Dense 3x3 stencils for every `(out channel x out rotation, in channel x
/// in rotation)` pair, plus the bias repeated over output rotations.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedKernel {
    out_channels: usize,
    out_rotations: usize,
    in_planes: usize,
    taps: Vec<f32>,
    bias: Vec<f32>,
}

impl ExpandedKernel {
    /// Gathers `compact` into stencils for `out_rotations` output
    /// orientations, which must be 1 or 6.
    pub fn expand(compact: &CompactKernel, out_rotations: usize) -> Result<Self, IcoError> {
        let rin = compact.in_rotations();
        let index = expansion_indices(compact.out_channels(), out_rotations, compact.in_channels(), rin)?;
        let taps = index
            .chunks(4)
            .map(|e| match *e {
                [co, ci, ri, s] if s >= 0 => compact.weight(co as usize, ci as usize, ri as usize, s as usize),
                _ => 0.0,
            })
            .collect();
        let in_planes = compact.in_channels() * rin;

        let bias = compact
            .bias()
            .iter()
            .flat_map(|&b| std::iter::repeat(b).take(out_rotations))
            .collect();

        Ok(ExpandedKernel {
            out_channels: compact.out_channels(),
            out_rotations,
            in_planes,
            taps,
            bias,
        })
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Output rotations.
    pub fn out_rotations(&self) -> usize {
        self.out_rotations
    }

    /// `out channels x out rotations`.
    pub fn out_planes(&self) -> usize {
        self.out_channels * self.out_rotations
    }

    /// `in channels x in rotations`.
    pub fn in_planes(&self) -> usize {
        self.in_planes
    }

    /// The 3x3 stencil linking an input plane to an output plane.
    #[inline]
    pub fn stencil(&self, out_plane: usize, in_plane: usize) -> &[f32] {
        &self.taps[(out_plane * self.in_planes + in_plane) * TAPS..][..TAPS]
    }

    /// The flat taps, shaped `(out planes, in planes, 3, 3)`.
    pub fn taps(&self) -> &[f32] {
        &self.taps
    }

    /// Bias per output plane.
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::rotate;

    fn counting_kernel(cout: usize, cin: usize, rin: usize) -> CompactKernel {
        CompactKernel::from_fn(cout, cin, rin, vec![0.5; cout], |co, ci, ri, s| {
            (co * 1000 + ci * 100 + ri * 10 + s) as f32
        })
        .unwrap()
    }

    #[test]
    fn slot_order_is_a_sixth_turn() {
        for s in 1..SLOTS {
            let (i, j) = SLOT_OFFSETS[s];
            assert_eq!(rotate(i, j, 1), SLOT_OFFSETS[turn_slot(s, 1)]);
        }
        assert_eq!(turn_slot(6, 1), 1);
        assert_eq!(turn_slot(0, 4), 0);
    }

    #[test]
    fn unrotated_expansion_places_slots() {
        let k = counting_kernel(1, 1, 1);
        let e = ExpandedKernel::expand(&k, 1).unwrap();
        let st = e.stencil(0, 0);
        assert_eq!(st, &[5.0, 6.0, 0.0, 4.0, 0.0, 1.0, 0.0, 3.0, 2.0]);
        assert_eq!(e.bias(), &[0.5]);
    }

    #[test]
    fn non_neighbor_corners_stay_zero() {
        let k = counting_kernel(2, 2, 6);
        let e = ExpandedKernel::expand(&k, 6).unwrap();
        for o in 0..e.out_planes() {
            for p in 0..e.in_planes() {
                let st = e.stencil(o, p);
                assert_eq!(st[tap_index((-1, 1))], 0.0);
                assert_eq!(st[tap_index((1, -1))], 0.0);
            }
        }
    }

    #[test]
    fn output_rotations_turn_the_ring() {
        let k = counting_kernel(1, 1, 1);
        let e = ExpandedKernel::expand(&k, 6).unwrap();
        for ro in 0..6 {
            let st = e.stencil(ro, 0);
            for s in 0..SLOTS {
                let (i, j) = SLOT_OFFSETS[s];
                let (ti, tj) = rotate(i, j, ro as u8);
                assert_eq!(st[tap_index((ti, tj))], s as f32);
            }
        }
        assert_eq!(e.bias(), &[0.5; 6]);
    }

    #[test]
    fn input_rotations_cycle_against_output() {
        let k = counting_kernel(1, 1, 6);
        let e = ExpandedKernel::expand(&k, 6).unwrap();
        // ro = 2, ri = 1 reads compact rotation 5; center tap is slot 0
        assert_eq!(e.stencil(2, 1)[tap_index((0, 0))], 50.0);
        assert_eq!(e.stencil(0, 3)[tap_index((0, 1))], 31.0);
    }

    #[test]
    fn shapes_are_validated() {
        assert!(matches!(
            CompactKernel::new(2, 1, 1, vec![0.0; 13], vec![0.0; 2]),
            Err(IcoError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            CompactKernel::new(2, 1, 1, vec![0.0; 14], vec![0.0; 3]),
            Err(IcoError::ShapeMismatch { .. })
        ));
        let k = counting_kernel(1, 1, 1);
        assert!(ExpandedKernel::expand(&k, 4).is_err());
    }

    #[test]
    fn index_table_names_every_weight_once_per_stencil() {
        let index = expansion_indices(2, 6, 3, 6).unwrap();
        assert_eq!(index.len(), 2 * 6 * 3 * 6 * TAPS * 4);
        for (n, stencil) in index.chunks(TAPS * 4).enumerate() {
            let (co, ci) = ((n / 6 / 3 / 6) as i32, ((n / 6) % 3) as i32);
            let mut slots: Vec<i32> = stencil.chunks(4).filter(|e| e[3] >= 0).map(|e| e[3]).collect();
            slots.sort();
            assert_eq!(slots, (0..SLOTS as i32).collect::<Vec<_>>());
            for e in stencil.chunks(4).filter(|e| e[3] >= 0) {
                assert_eq!((e[0], e[1]), (co, ci));
            }
            assert_eq!(&stencil[tap_index((-1, 1)) * 4..][..4], &[-1; 4]);
            assert_eq!(&stencil[tap_index((1, -1)) * 4..][..4], &[-1; 4]);
        }
        assert!(expansion_indices(1, 4, 1, 1).is_err());
        assert!(expansion_indices(1, 1, 1, 2).is_err());
    }

    #[test]
    fn index_table_rebuilds_the_stencils() {
        let k = counting_kernel(2, 2, 6);
        let e = ExpandedKernel::expand(&k, 6).unwrap();
        let index = expansion_indices(2, 6, 2, 6).unwrap();
        for (tap, entry) in e.taps().iter().zip(index.chunks(4)) {
            let expected = if entry[3] < 0 {
                0.0
            } else {
                (entry[0] * 1000 + entry[1] * 100 + entry[2] * 10 + entry[3]) as f32
            };
            assert_eq!(*tap, expected);
        }
        // ro = 2, ri = 1 reads compact rotation 5 at the center
        let stencil = 2 * 2 * 6 + 1;
        let at = stencil * TAPS + tap_index((0, 0));
        assert_eq!(&index[at * 4..][..4], &[0, 0, 5, 0]);
    }

    #[test]
    fn turning_keeps_the_center() {
        let k = counting_kernel(1, 1, 1);
        let t = k.turned(1);
        assert_eq!(t.weight(0, 0, 0, 0), 0.0);
        assert_eq!(t.weight(0, 0, 0, 1), 2.0);
        assert_eq!(t.weight(0, 0, 0, 6), 1.0);
    }
}
