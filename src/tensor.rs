//! Dense feature tensors indexed by `(channel, rotation, chart, row, col)`.
//!
//! Storage is row-major in exactly that axis order, so channels and
//! rotations are the two slowest axes and the chart axis sits directly
//! above the rows. The packing step of the convolution relies on this.

use crate::error::IcoError;
use crate::topology::{GridTopology, CHARTS};

/// Axis sizes of a [FeatureTensor].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Feature channels
    pub channels: usize,
    /// Rotation copies per channel
    pub rotations: usize,
    /// Charts, always 5 for tensors living on the grid
    pub charts: usize,
    /// Rows per chart
    pub rows: usize,
    /// Columns per chart
    pub cols: usize,
}

impl Shape {
    /// Shape of an unpadded tensor on `topology`.
    pub fn on_grid(topology: &GridTopology, channels: usize, rotations: usize) -> Self {
        Shape {
            channels,
            rotations,
            charts: CHARTS,
            rows: topology.height(),
            cols: topology.width(),
        }
    }

    /// The same tensor with one extra ring of cells around every chart.
    pub fn padded(self) -> Self {
        Shape {
            rows: self.rows + 2,
            cols: self.cols + 2,
            ..self
        }
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.channels * self.rotations * self.charts * self.rows * self.cols
    }

    /// Whether the shape holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements in one `(chart, row, col)` block.
    pub fn plane_len(&self) -> usize {
        self.charts * self.rows * self.cols
    }

    /// The axis sizes as an array, outermost first.
    pub fn dims(&self) -> [usize; 5] {
        [
            self.channels,
            self.rotations,
            self.charts,
            self.rows,
            self.cols,
        ]
    }

    /// Builds a shape from five axis sizes.
    pub fn from_dims(dims: &[usize]) -> Result<Self, IcoError> {
        match *dims {
            [channels, rotations, charts, rows, cols] => Ok(Shape {
                channels,
                rotations,
                charts,
                rows,
                cols,
            }),
            _ => Err(IcoError::ShapeMismatch {
                what: "tensor rank",
                expected: vec![5],
                found: vec![dims.len()],
            }),
        }
    }

    /// Flat offset of an element.
    #[inline]
    pub fn offset(&self, channel: usize, rotation: usize, chart: usize, row: usize, col: usize) -> usize {
        (((channel * self.rotations + rotation) * self.charts + chart) * self.rows + row) * self.cols
            + col
    }

    /// Fails with [IcoError::ShapeMismatch] unless `self == expected`.
    pub fn expect(&self, expected: Shape, what: &'static str) -> Result<(), IcoError> {
        if *self == expected {
            Ok(())
        } else {
            Err(IcoError::ShapeMismatch {
                what,
                expected: expected.dims().to_vec(),
                found: self.dims().to_vec(),
            })
        }
    }
}

/// An owned block of `f32` features.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    shape: Shape,
    data: Vec<f32>,
}

impl FeatureTensor {
    /// A tensor of zeros.
    pub fn zeros(shape: Shape) -> Self {
        FeatureTensor {
            shape,
            data: vec![0.0; shape.len()],
        }
    }

    /// A tensor with every element set to `value`.
    pub fn filled(shape: Shape, value: f32) -> Self {
        FeatureTensor {
            shape,
            data: vec![value; shape.len()],
        }
    }

    /// Wraps existing storage, which must hold exactly `shape.len()` values.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self, IcoError> {
        if data.len() != shape.len() {
            return Err(IcoError::ShapeMismatch {
                what: "tensor storage",
                expected: vec![shape.len()],
                found: vec![data.len()],
            });
        }
        Ok(FeatureTensor { shape, data })
    }

    /// Builds a tensor by evaluating `f` at every index.
    pub fn from_fn(shape: Shape, mut f: impl FnMut(usize, usize, usize, usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(shape.len());
        for c in 0..shape.channels {
            for r in 0..shape.rotations {
                for k in 0..shape.charts {
                    for i in 0..shape.rows {
                        for j in 0..shape.cols {
                            data.push(f(c, r, k, i, j));
                        }
                    }
                }
            }
        }
        FeatureTensor { shape, data }
    }

    /// The axis sizes.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Flat storage.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable flat storage.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Gives up the flat storage.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Reads one element.
    #[inline]
    pub fn get(&self, channel: usize, rotation: usize, chart: usize, row: usize, col: usize) -> f32 {
        self.data[self.shape.offset(channel, rotation, chart, row, col)]
    }

    /// Writes one element.
    #[inline]
    pub fn set(&mut self, channel: usize, rotation: usize, chart: usize, row: usize, col: usize, value: f32) {
        let at = self.shape.offset(channel, rotation, chart, row, col);
        self.data[at] = value;
    }

    /// The `(chart, row, col)` block of one channel and rotation.
    pub fn plane(&self, channel: usize, rotation: usize) -> &[f32] {
        let len = self.shape.plane_len();
        let start = (channel * self.shape.rotations + rotation) * len;
        &self.data[start..start + len]
    }

    /// Drops a ring of `margin` cells from every chart.
    pub fn crop(&self, margin: usize) -> Result<FeatureTensor, IcoError> {
        let s = self.shape;
        if s.rows < 2 * margin || s.cols < 2 * margin {
            return Err(IcoError::ShapeMismatch {
                what: "cropped tensor",
                expected: vec![2 * margin, 2 * margin],
                found: vec![s.rows, s.cols],
            });
        }
        let out = Shape {
            rows: s.rows - 2 * margin,
            cols: s.cols - 2 * margin,
            ..s
        };
        Ok(FeatureTensor::from_fn(out, |c, r, k, i, j| {
            self.get(c, r, k, i + margin, j + margin)
        }))
    }

    /// Moves every chart `steps` places forward, wrapping around.
    pub fn roll_charts(&self, steps: usize) -> FeatureTensor {
        let s = self.shape;
        FeatureTensor::from_fn(s, |c, r, k, i, j| {
            self.get(c, r, (k + s.charts - steps % s.charts) % s.charts, i, j)
        })
    }

    /// Largest absolute element-wise difference, or `None` when the shapes
    /// disagree.
    pub fn max_abs_diff(&self, other: &FeatureTensor) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Shape {
        Shape {
            channels: 2,
            rotations: 3,
            charts: 5,
            rows: 2,
            cols: 4,
        }
    }

    #[test]
    fn offsets_are_row_major() {
        let s = small();
        assert_eq!(s.offset(0, 0, 0, 0, 1), 1);
        assert_eq!(s.offset(0, 0, 0, 1, 0), 4);
        assert_eq!(s.offset(0, 0, 1, 0, 0), 8);
        assert_eq!(s.offset(0, 1, 0, 0, 0), 40);
        assert_eq!(s.offset(1, 0, 0, 0, 0), 120);
        assert_eq!(s.len(), 240);
    }

    #[test]
    fn from_vec_checks_length() {
        assert!(FeatureTensor::from_vec(small(), vec![0.0; 240]).is_ok());
        assert!(matches!(
            FeatureTensor::from_vec(small(), vec![0.0; 239]),
            Err(IcoError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn crop_inverts_padded_shape() {
        let s = small();
        let t = FeatureTensor::from_fn(s.padded(), |c, r, k, i, j| {
            (c * 10000 + r * 1000 + k * 100 + i * 10 + j) as f32
        });
        let cropped = t.crop(1).unwrap();
        assert_eq!(cropped.shape(), s);
        assert_eq!(cropped.get(1, 2, 4, 0, 0), 12411.0);
    }

    #[test]
    fn roll_charts_wraps() {
        let t = FeatureTensor::from_fn(small(), |_, _, k, _, _| k as f32);
        let rolled = t.roll_charts(1);
        assert_eq!(rolled.get(0, 0, 0, 0, 0), 4.0);
        assert_eq!(rolled.get(0, 0, 3, 0, 0), 2.0);
        assert_eq!(t.roll_charts(5), t);
    }

    #[test]
    fn from_dims_requires_rank_five() {
        assert_eq!(Shape::from_dims(&small().dims()).unwrap(), small());
        assert!(Shape::from_dims(&[1, 2, 3]).is_err());
    }
}
