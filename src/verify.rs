//! Cross-checks between independently built pieces: the adjacency table
//! against the padding map, and any two sets of numbers against each
//! other.

use std::fmt;

use log::{info, warn};

use crate::adjacency::AdjacencyTable;
use crate::error::IcoError;
use crate::kernel::SLOT_OFFSETS;
use crate::padding::PaddingIndexMap;
use crate::topology::GridTopology;

/// Max error below which two dumps count as the same.
pub const PASS_TOLERANCE: f32 = 1e-5;

/// Max error below which a mismatch is only rounding noise.
pub const SMALL_ERROR_TOLERANCE: f32 = 1e-3;

/// Checks that, for every stored vertex and every slot, the table names
/// the same vertex and frame shift the padding map gathers from.
///
/// Every disagreement is counted; the error names the first one.
pub fn check_topology(
    topology: &GridTopology,
    padding: &PaddingIndexMap,
    table: &AdjacencyTable,
) -> Result<(), IcoError> {
    if table.len() != topology.stored_cells() {
        return Err(IcoError::ShapeMismatch {
            what: "adjacency table rows",
            expected: vec![topology.stored_cells()],
            found: vec![table.len()],
        });
    }

    let mut first = None;
    let mut count = 0;
    for cell in topology.cells() {
        let v = topology.cell_id(cell);
        for (t, (di, dj)) in SLOT_OFFSETS.iter().enumerate() {
            let source = padding.source(cell.chart, cell.row as isize + di, cell.col as isize + dj);
            let id = source.vertex(topology);
            let (table_id, table_shift) = (table.neighbors(v)[t], table.shifts(v)[t]);
            if id != table_id || source.shift() != table_shift {
                count += 1;
                if first.is_none() {
                    first = Some((v, t, id, source.shift(), table_id, table_shift));
                }
            }
        }
    }

    match first {
        None => {
            info!(
                "adjacency table agrees with padding map at resolution {}",
                topology.resolution()
            );
            Ok(())
        }
        Some((v, t, id, shift, table_id, table_shift)) => {
            warn!("{} neighbor disagreements, first at vertex {} slot {}", count, v, t);
            Err(IcoError::TopologyInconsistency {
                vertex: Some(v),
                slot: Some(t),
                detail: format!(
                    "padding reads vertex {} shift {}, table has vertex {} shift {} ({} disagreements in total)",
                    id, shift, table_id, table_shift, count
                ),
            })
        }
    }
}

/// Minimum, maximum, and mean of one side of a comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Smallest value
    pub min: f32,
    /// Largest value
    pub max: f32,
    /// Arithmetic mean
    pub mean: f32,
}

impl Summary {
    fn of(values: &[f32]) -> Self {
        if values.is_empty() {
            return Summary {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let sum: f64 = values.iter().map(|&v| v as f64).sum();
        Summary {
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            mean: (sum / values.len() as f64) as f32,
        }
    }
}

/// How bad a comparison is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Max error under [PASS_TOLERANCE]
    Pass,
    /// Max error under [SMALL_ERROR_TOLERANCE]
    SmallError,
    /// Anything larger
    Fail,
}

/// Element-wise statistics of two equally long value sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    /// Number of values compared
    pub count: usize,
    /// Largest absolute difference
    pub max_error: f32,
    /// Where `max_error` happens
    pub max_index: usize,
    /// Root mean square difference
    pub rmse: f32,
    /// Mean absolute difference
    pub mean_abs_error: f32,
    /// Statistics of the reference values
    pub expected: Summary,
    /// Statistics of the values under test
    pub found: Summary,
    expected_at_max: f32,
    found_at_max: f32,
}

impl ComparisonReport {
    /// Compares `found` against `expected`. Different lengths are a
    /// [IcoError::ShapeMismatch].
    pub fn new(expected: &[f32], found: &[f32]) -> Result<Self, IcoError> {
        if expected.len() != found.len() {
            return Err(IcoError::ShapeMismatch {
                what: "compared values",
                expected: vec![expected.len()],
                found: vec![found.len()],
            });
        }

        let mut max_error = 0.0f32;
        let mut max_index = 0;
        let mut sq = 0.0f64;
        let mut abs = 0.0f64;
        for (i, (a, b)) in expected.iter().zip(found).enumerate() {
            let d = (a - b).abs();
            // NaN on either side counts as the worst possible error
            if d > max_error || (d.is_nan() && !max_error.is_nan()) {
                max_error = d;
                max_index = i;
            }
            sq += (d as f64) * (d as f64);
            abs += d as f64;
        }
        let n = expected.len().max(1) as f64;

        Ok(ComparisonReport {
            count: expected.len(),
            max_error,
            max_index,
            rmse: (sq / n).sqrt() as f32,
            mean_abs_error: (abs / n) as f32,
            expected: Summary::of(expected),
            found: Summary::of(found),
            expected_at_max: expected.get(max_index).copied().unwrap_or(0.0),
            found_at_max: found.get(max_index).copied().unwrap_or(0.0),
        })
    }

    /// Classifies the max error.
    pub fn verdict(&self) -> Verdict {
        if self.max_error < PASS_TOLERANCE {
            Verdict::Pass
        } else if self.max_error < SMALL_ERROR_TOLERANCE {
            Verdict::SmallError
        } else {
            Verdict::Fail
        }
    }

    /// Fails with [IcoError::NumericDivergence] if the max error is above
    /// `tolerance`.
    pub fn check(&self, tolerance: f32) -> Result<(), IcoError> {
        if self.max_error <= tolerance {
            Ok(())
        } else {
            Err(IcoError::NumericDivergence {
                index: self.max_index,
                expected: self.expected_at_max,
                found: self.found_at_max,
                magnitude: self.max_error,
                tolerance,
            })
        }
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "values:     {}", self.count)?;
        writeln!(
            f,
            "expected:   min={:.6} max={:.6} mean={:.6}",
            self.expected.min, self.expected.max, self.expected.mean
        )?;
        writeln!(
            f,
            "found:      min={:.6} max={:.6} mean={:.6}",
            self.found.min, self.found.max, self.found.mean
        )?;
        writeln!(f, "max error:  {:.8} at index {}", self.max_error, self.max_index)?;
        writeln!(f, "rmse:       {:.8}", self.rmse)?;
        writeln!(f, "mean error: {:.8}", self.mean_abs_error)?;
        write!(f, "verdict:    {:?}", self.verdict())
    }
}
