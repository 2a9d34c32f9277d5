//! Extends every chart by one ring of cells sourced from its neighbors.
//!
//! The [PaddingIndexMap] is computed once per resolution. Each padded cell
//! records the stored cell it copies, or the pole it stands for, plus the
//! frame rotation picked up crossing seams. Rotated features are gathered
//! as `padded[r] = source[(r + shift) % R]`; poles are not stored and read
//! as zero.
//!
//! Two padded cells per chart sit in the wedge left open by a cone vertex
//! and can be reached through either adjacent seam. The map keeps both
//! readings as an [AmbiguousCell]; the padded tensor always carries the
//! canonical one, and the alternate is what the reconciler blends in.

use log::debug;

use crate::error::IcoError;
use crate::tensor::{FeatureTensor, Shape};
use crate::topology::{Cell, GridTopology, Pole, Resolved, Side, Site, CHARTS, RING};

/// Where one padded cell takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PadSource {
    /// A stored cell, with the frame shift in sixth-turns
    Cell {
        /// Global id of the cell, which is also its offset in a plane
        id: usize,
        /// Frame rotation in `0..6`
        shift: u8,
    },
    /// An unstored pole, read as zero
    Pole(Pole),
}

impl PadSource {
    fn from_resolved(topology: &GridTopology, resolved: Resolved) -> Self {
        match resolved.site {
            Site::Cell(cell) => PadSource::Cell {
                id: topology.cell_id(cell),
                shift: resolved.shift,
            },
            Site::Pole(pole) => PadSource::Pole(pole),
        }
    }

    /// Global vertex id of the source.
    pub fn vertex(&self, topology: &GridTopology) -> usize {
        match *self {
            PadSource::Cell { id, .. } => id,
            PadSource::Pole(pole) => topology.pole_id(pole),
        }
    }

    /// Frame shift of the source; poles carry none.
    pub fn shift(&self) -> u8 {
        match *self {
            PadSource::Cell { shift, .. } => shift,
            PadSource::Pole(_) => 0,
        }
    }

    /// Reads the source for one channel and rotation of an unpadded tensor.
    #[inline]
    pub fn gather(&self, input: &FeatureTensor, channel: usize, rotation: usize) -> f32 {
        match *self {
            PadSource::Cell { id, shift } => {
                let rotations = input.shape().rotations;
                let r = (rotation + shift as usize) % rotations;
                input.plane(channel, r)[id]
            }
            PadSource::Pole(_) => 0.0,
        }
    }
}

/// A padded cell with two valid readings, next to a cone vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmbiguousCell {
    /// The cone vertex whose stencil reads this cell
    pub cone: Cell,
    /// Stencil offset from `cone` to the padded cell
    pub offset: (isize, isize),
    /// The reading stored in the padded tensor
    pub canonical: PadSource,
    /// The reading through the other seam
    pub alternate: PadSource,
}

/// The fixed gather table that pads a tensor on the grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingIndexMap {
    height: usize,
    width: usize,
    sources: Vec<PadSource>,
    ambiguous: Vec<AmbiguousCell>,
}

impl PaddingIndexMap {
    /// Resolves every padded position of every chart.
    pub fn new(topology: &GridTopology) -> Result<Self, IcoError> {
        let (h, w) = (topology.height(), topology.width());
        let mut sources = Vec::with_capacity(CHARTS * (h + 2) * (w + 2));

        for chart in 0..CHARTS {
            for row in -1..=h as isize {
                for col in -1..=w as isize {
                    let resolved = topology.resolve(chart, row, col)?;
                    sources.push(PadSource::from_resolved(topology, resolved));
                }
            }
        }

        let n = h as isize;
        let mut ambiguous = Vec::with_capacity(2 * CHARTS);
        for chart in 0..CHARTS {
            // U_k reads (-1,-1), L_k reads (-1,H)
            for (cone_col, at, through) in [(0, (-1, -1), Side::Col0), (n, (-1, n), Side::Row0Head)] {
                let canonical = topology.resolve(chart, at.0, at.1)?;
                let alternate = topology.resolve_through(chart, at.0, at.1, through)?;
                ambiguous.push(AmbiguousCell {
                    cone: Cell {
                        chart,
                        row: 0,
                        col: cone_col as usize,
                    },
                    offset: (at.0, at.1 - cone_col),
                    canonical: PadSource::from_resolved(topology, canonical),
                    alternate: PadSource::from_resolved(topology, alternate),
                });
            }
        }

        debug!(
            "padding map for resolution {}: {} padded cells, {} ambiguous",
            topology.resolution(),
            sources.len(),
            ambiguous.len()
        );

        Ok(PaddingIndexMap {
            height: h,
            width: w,
            sources,
            ambiguous,
        })
    }

    /// The source of a position given in unpadded coordinates, each in
    /// `-1..=H` and `-1..=W`.
    pub fn source(&self, chart: usize, row: isize, col: isize) -> PadSource {
        let (pr, pc) = ((row + 1) as usize, (col + 1) as usize);
        self.sources[(chart * (self.height + 2) + pr) * (self.width + 2) + pc]
    }

    /// The cells next to cone vertices that have two readings.
    pub fn ambiguous(&self) -> &[AmbiguousCell] {
        &self.ambiguous
    }

    /// Shape of the unpadded tensors this map accepts.
    pub fn input_shape(&self, channels: usize, rotations: usize) -> Shape {
        Shape {
            channels,
            rotations,
            charts: CHARTS,
            rows: self.height,
            cols: self.width,
        }
    }

    /// Pads `input`, which must be `(C, R, 5, H, W)` with `R` either 1 or 6.
    pub fn apply(&self, input: &FeatureTensor) -> Result<FeatureTensor, IcoError> {
        let s = input.shape();
        s.expect(self.input_shape(s.channels, s.rotations), "padding input")?;
        check_rotations(s.rotations)?;

        let out_shape = s.padded();
        let plane = out_shape.plane_len();
        let mut out = FeatureTensor::zeros(out_shape);
        let data = out.data_mut();

        for c in 0..s.channels {
            for r in 0..s.rotations {
                let base = (c * s.rotations + r) * plane;
                for (p, source) in self.sources.iter().enumerate() {
                    data[base + p] = source.gather(input, c, r);
                }
            }
        }

        Ok(out)
    }

    /// The map as flat gather indices shaped `(rotations, 5, H + 2, W + 2)`.
    ///
    /// Each entry is an offset into one channel of the unpadded input, laid
    /// out `(rotations, 5, H, W)`, with the frame shift already applied to
    /// the rotation. Poles are `-1`. This is the table fixed hardware
    /// loads in place of [PaddingIndexMap::apply].
    pub fn flat_indices(&self, rotations: usize) -> Result<Vec<i64>, IcoError> {
        check_rotations(rotations)?;
        let plane = CHARTS * self.height * self.width;
        let mut out = Vec::with_capacity(rotations * self.sources.len());
        for r in 0..rotations {
            out.extend(self.sources.iter().map(|source| match *source {
                PadSource::Cell { id, shift } => (((r + shift as usize) % rotations) * plane + id) as i64,
                PadSource::Pole(_) => -1,
            }));
        }
        Ok(out)
    }
}

/// Rotation axes hold either a scalar field or a full copy per sixth-turn.
pub(crate) fn check_rotations(rotations: usize) -> Result<(), IcoError> {
    if rotations == 1 || rotations == RING {
        Ok(())
    } else {
        Err(IcoError::ShapeMismatch {
            what: "rotation axis",
            expected: vec![1, RING],
            found: vec![rotations],
        })
    }
}
