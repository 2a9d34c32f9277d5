//! Makes cone vertices single-valued after cropping.
//!
//! A cone vertex has five neighbors but its stencil has six ring taps, so
//! one padded cell in its wedge can be read through either adjacent seam
//! and the convolution gives one value per reading. The reconciler turns
//! those copies into one value with a fixed rule chosen at configuration:
//! [ReconcileMode::Clean] keeps the canonical copy that the dense path
//! already wrote, [ReconcileMode::Smooth] writes the mean of all copies,
//! and [ReconcileMode::Zero] clears every cone vertex the way the fixed
//! point hardware layer does.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::IcoError;
use crate::padding::PadSource;
use crate::tensor::FeatureTensor;
use crate::topology::Cell;

/// How duplicate copies of a cone vertex are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum ReconcileMode {
    /// Keep the canonical copy
    #[default]
    Clean,
    /// Average every copy
    Smooth,
    /// Write zero at every cone vertex, matching the hardware layer bit for
    /// bit at those ten cells
    Zero,
}

/// One computed copy of a cone vertex, for every output plane.
#[derive(Debug, Clone, PartialEq)]
pub struct SeamCopy {
    /// The padded cell reading that produced it
    pub source: PadSource,
    /// Whether this is the reading the padded tensor carries
    pub canonical: bool,
    /// One value per `(out channel, out rotation)` plane
    pub values: Vec<f32>,
}

/// Every copy of every cone vertex of one forward pass.
///
/// Copies are kept sorted, canonical first and then by source, so the
/// order they were recorded in never shows up in the result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeamCopies {
    planes: usize,
    copies: BTreeMap<Cell, Vec<SeamCopy>>,
}

impl SeamCopies {
    /// An empty set for tensors with `planes` output planes.
    pub fn new(planes: usize) -> Self {
        SeamCopies {
            planes,
            copies: BTreeMap::new(),
        }
    }

    /// Adds one copy of `cone`.
    pub fn record(&mut self, cone: Cell, copy: SeamCopy) -> Result<(), IcoError> {
        if copy.values.len() != self.planes {
            return Err(IcoError::ShapeMismatch {
                what: "seam copy",
                expected: vec![self.planes],
                found: vec![copy.values.len()],
            });
        }
        let list = self.copies.entry(cone).or_default();
        if copy.canonical && list.iter().any(|c| c.canonical) {
            return Err(IcoError::Configuration(format!(
                "cone vertex {:?} already has a canonical copy",
                cone
            )));
        }
        let key = |c: &SeamCopy| (!c.canonical, c.source);
        let at = list.partition_point(|c| key(c) <= key(&copy));
        list.insert(at, copy);
        Ok(())
    }

    /// Number of vertices with copies.
    pub fn len(&self) -> usize {
        self.copies.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Vertices and their copies, in cell order.
    pub fn iter(&self) -> impl Iterator<Item = (&Cell, &[SeamCopy])> {
        self.copies.iter().map(|(cell, list)| (cell, list.as_slice()))
    }
}

/// Applies the configured [ReconcileMode]. The mode is fixed once chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeamReconciler {
    mode: ReconcileMode,
}

impl SeamReconciler {
    /// A reconciler using `mode` for every pass.
    pub fn new(mode: ReconcileMode) -> Self {
        SeamReconciler { mode }
    }

    /// The configured mode.
    pub fn mode(&self) -> ReconcileMode {
        self.mode
    }

    /// Restating the current mode is fine; asking for a different one is a
    /// [IcoError::Configuration].
    pub fn configure(&mut self, mode: ReconcileMode) -> Result<(), IcoError> {
        if mode != self.mode {
            return Err(IcoError::Configuration(format!(
                "reconciliation mode is {:?} and cannot change to {:?}",
                self.mode, mode
            )));
        }
        Ok(())
    }

    /// Writes one value per cone vertex into the cropped `output`.
    pub fn reconcile(&self, output: &mut FeatureTensor, copies: &SeamCopies) -> Result<(), IcoError> {
        let s = output.shape();
        let rotations = s.rotations;
        if s.channels * rotations != copies.planes {
            return Err(IcoError::ShapeMismatch {
                what: "reconciled tensor planes",
                expected: vec![copies.planes],
                found: vec![s.channels * rotations],
            });
        }

        for (cone, list) in copies.iter() {
            if cone.row >= s.rows || cone.col >= s.cols || cone.chart >= s.charts {
                return Err(IcoError::ShapeMismatch {
                    what: "reconciled tensor",
                    expected: vec![cone.chart + 1, cone.row + 1, cone.col + 1],
                    found: vec![s.charts, s.rows, s.cols],
                });
            }
            for o in 0..copies.planes {
                let value = match self.mode {
                    ReconcileMode::Clean => match list.iter().find(|c| c.canonical) {
                        Some(c) => c.values[o],
                        None => continue,
                    },
                    ReconcileMode::Smooth => {
                        list.iter().map(|c| c.values[o]).sum::<f32>() / list.len() as f32
                    }
                    ReconcileMode::Zero => 0.0,
                };
                output.set(o / rotations, o % rotations, cone.chart, cone.row, cone.col, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;
    use rand::seq::SliceRandom;

    fn cone(chart: usize, col: usize) -> Cell {
        Cell { chart, row: 0, col }
    }

    fn copy(id: usize, canonical: bool, values: Vec<f32>) -> SeamCopy {
        SeamCopy {
            source: PadSource::Cell { id, shift: 0 },
            canonical,
            values,
        }
    }

    fn output() -> FeatureTensor {
        FeatureTensor::from_fn(
            Shape {
                channels: 1,
                rotations: 2,
                charts: 5,
                rows: 2,
                cols: 4,
            },
            |_, r, k, i, j| (r * 1000 + k * 100 + i * 10 + j) as f32,
        )
    }

    #[test]
    fn clean_is_idempotent() {
        let mut copies = SeamCopies::new(2);
        copies.record(cone(1, 0), copy(4, false, vec![7.0, 8.0])).unwrap();
        copies.record(cone(1, 0), copy(3, true, vec![100.0, 1100.0])).unwrap();

        let r = SeamReconciler::new(ReconcileMode::Clean);
        let mut once = output();
        r.reconcile(&mut once, &copies).unwrap();
        let mut twice = once.clone();
        r.reconcile(&mut twice, &copies).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, output());
    }

    #[test]
    fn smooth_averages_copies() {
        let mut copies = SeamCopies::new(2);
        copies.record(cone(2, 2), copy(9, true, vec![1.0, 2.0])).unwrap();
        copies.record(cone(2, 2), copy(5, false, vec![3.0, 6.0])).unwrap();

        let r = SeamReconciler::new(ReconcileMode::Smooth);
        let mut out = output();
        r.reconcile(&mut out, &copies).unwrap();
        assert_eq!(out.get(0, 0, 2, 0, 2), 2.0);
        assert_eq!(out.get(0, 1, 2, 0, 2), 4.0);
        assert_eq!(out.get(0, 0, 2, 0, 1), 201.0);
    }

    #[test]
    fn smooth_ignores_visit_order() {
        let values: Vec<(usize, bool, Vec<f32>)> = vec![
            (11, true, vec![0.1, 0.7]),
            (2, false, vec![1e7, -3.3]),
            (40, false, vec![-1e7, 0.0001]),
            (8, false, vec![0.3, 2.5]),
        ];
        let r = SeamReconciler::new(ReconcileMode::Smooth);
        let mut reference: Option<FeatureTensor> = None;
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let mut shuffled = values.clone();
            shuffled.shuffle(&mut rng);
            let mut copies = SeamCopies::new(2);
            for (id, canonical, v) in shuffled {
                copies.record(cone(0, 0), copy(id, canonical, v)).unwrap();
            }
            let mut out = output();
            r.reconcile(&mut out, &copies).unwrap();
            match &reference {
                Some(expected) => assert_eq!(expected, &out),
                None => reference = Some(out),
            }
        }
    }

    #[test]
    fn zero_clears_only_the_cone() {
        let mut copies = SeamCopies::new(2);
        copies.record(cone(3, 2), copy(9, true, vec![5.0, 6.0])).unwrap();
        copies.record(cone(3, 2), copy(5, false, vec![7.0, 8.0])).unwrap();

        let r = SeamReconciler::new(ReconcileMode::Zero);
        let mut out = output();
        r.reconcile(&mut out, &copies).unwrap();
        assert_eq!(out.get(0, 0, 3, 0, 2), 0.0);
        assert_eq!(out.get(0, 1, 3, 0, 2), 0.0);

        out.set(0, 0, 3, 0, 2, 302.0);
        out.set(0, 1, 3, 0, 2, 1302.0);
        assert_eq!(out, output());
    }

    #[test]
    fn zero_mode_reads_from_ron() {
        let mode: ReconcileMode = ron::from_str("Zero").unwrap();
        assert_eq!(mode, ReconcileMode::Zero);
        assert!(matches!(
            SeamReconciler::new(mode).configure(ReconcileMode::Clean),
            Err(IcoError::Configuration(_))
        ));
    }

    #[test]
    fn mode_cannot_change() {
        let mut r = SeamReconciler::new(ReconcileMode::Clean);
        assert!(r.configure(ReconcileMode::Clean).is_ok());
        assert!(matches!(
            r.configure(ReconcileMode::Smooth),
            Err(IcoError::Configuration(_))
        ));
        assert_eq!(r.mode(), ReconcileMode::Clean);
    }

    #[test]
    fn copies_must_match_planes() {
        let mut copies = SeamCopies::new(3);
        assert!(copies.record(cone(0, 0), copy(1, true, vec![1.0])).is_err());
        copies.record(cone(0, 0), copy(1, true, vec![1.0; 3])).unwrap();
        assert!(copies.record(cone(0, 0), copy(2, true, vec![1.0; 3])).is_err());

        let r = SeamReconciler::new(ReconcileMode::Clean);
        let mut out = output();
        assert!(matches!(
            r.reconcile(&mut out, &copies),
            Err(IcoError::ShapeMismatch { .. })
        ));
    }
}
