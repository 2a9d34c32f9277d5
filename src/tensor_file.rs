//! This module reads and writes [TensorFile]s, the binary format used for
//! inputs, weights, outputs, and intermediate dumps. The files have the
//! following structure:
//!
//! - First a header with some metadata:
//!   - A free-form label, e.g. `"input"` or `"conv1.weight"`
//!   - The dimensions of one frame, outermost first
//!   - The number of frames stored back to back
//! - Then a separator, which is a byte of all 1s; `0xFF`. The header is
//!   UTF-8, so it can never contain that byte.
//! - Finally the values, big-endian `f32`s, frame after frame in row-major
//!   order.
//!
//! The header is encoded using [serde] and [ron]. In the file, it appears
//! as follows:
//!
//! ```text
//! (label:"input",dims:[1,1,5,4,8],frames:3)
//! ```

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::component::{Component, ComponentError};
use crate::error::{IcoError, LoadError};
use crate::kernel::{CompactKernel, SLOTS};
use crate::tensor::{FeatureTensor, Shape};

/// The header and values of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorFile {
    header: TensorFileHeader,
    samples: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
struct TensorFileHeader {
    label: String,
    dims: Vec<u64>,
    frames: u64,
}

/// Most frames one file may hold.
pub const MAX_FRAMES: usize = 1 << 20;

impl TensorFileHeader {
    /// Values the header promises, or `None` if that count does not fit.
    fn sample_count(&self) -> Option<usize> {
        if self.frames > MAX_FRAMES as u64 {
            return None;
        }
        let frame_len = self.dims.iter().try_fold(1u64, |n, &d| n.checked_mul(d))?;
        usize::try_from(frame_len.checked_mul(self.frames)?).ok()
    }
}

impl TensorFile {
    /// A single frame of arbitrary rank.
    pub fn from_values(label: impl Into<String>, dims: &[usize], values: Vec<f32>) -> Result<Self, LoadError> {
        let expected: usize = dims.iter().product();
        if expected != values.len() {
            return Err(LoadError::SampleCount {
                expected,
                found: values.len(),
            });
        }
        Ok(TensorFile {
            header: TensorFileHeader {
                label: label.into(),
                dims: dims.iter().map(|&d| d as u64).collect(),
                frames: 1,
            },
            samples: values,
        })
    }

    /// A single grid tensor.
    pub fn from_tensor(label: impl Into<String>, tensor: &FeatureTensor) -> Self {
        TensorFile {
            header: TensorFileHeader {
                label: label.into(),
                dims: tensor.shape().dims().iter().map(|&d| d as u64).collect(),
                frames: 1,
            },
            samples: tensor.data().to_vec(),
        }
    }

    /// Frames that all share one shape. An empty list needs that shape
    /// given separately.
    pub fn from_frames(label: impl Into<String>, shape: Shape, frames: &[FeatureTensor]) -> Result<Self, LoadError> {
        if frames.len() > MAX_FRAMES {
            return Err(LoadError::BadShape {
                what: format!("file of at most {} frames", MAX_FRAMES),
                dims: vec![frames.len()],
            });
        }
        let mut samples = Vec::with_capacity(shape.len() * frames.len());
        for frame in frames {
            frame.shape().expect(shape, "stored frame")?;
            samples.extend_from_slice(frame.data());
        }
        Ok(TensorFile {
            header: TensorFileHeader {
                label: label.into(),
                dims: shape.dims().iter().map(|&d| d as u64).collect(),
                frames: frames.len() as u64,
            },
            samples,
        })
    }

    /// The label from the header.
    pub fn label(&self) -> &str {
        &self.header.label
    }

    /// Dimensions of one frame.
    pub fn dims(&self) -> Vec<usize> {
        self.header.dims.iter().map(|&d| d as usize).collect()
    }

    /// Number of frames.
    pub fn frames(&self) -> usize {
        self.header.frames as usize
    }

    /// Every value, frame after frame.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Write out a [TensorFile] to the path provided.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let mut handle = File::create(path)?;
        self.to_file(&mut handle)
    }

    /// Write out a [TensorFile] to the [Write]able object provided.
    pub fn to_file(&self, file: &mut impl Write) -> Result<(), LoadError> {
        let h_str = ron::ser::to_string(&self.header)?;
        file.write_all(h_str.as_bytes())?;
        file.write_all(&[0xFF])?;
        let s_buf: Vec<u8> = self.samples.iter().flat_map(|f| f.to_be_bytes()).collect();
        file.write_all(&s_buf)?;
        Ok(())
    }

    /// Read a [TensorFile] from the path provided.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let mut handle = File::open(path)?;
        Self::from_file(&mut handle)
    }

    /// Read a [TensorFile] from the [Read]able object provided.
    pub fn from_file(file: &mut impl Read) -> Result<Self, LoadError> {
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        Self::from_bytes(&raw)
    }

    /// Parse a [TensorFile] already in memory.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, LoadError> {
        let delim_idx = raw.iter().position(|e| *e == 0xFF).ok_or(LoadError::NoDelimiter)?;
        let (header_buf, samples_buf) = raw.split_at(delim_idx);
        let samples_buf = &samples_buf[1..];

        let header = ron::de::from_bytes::<TensorFileHeader>(header_buf)?;

        let Some(expected) = header.sample_count() else {
            return Err(LoadError::BadShape {
                what: format!("header of {:?} with {} frames", header.label, header.frames),
                dims: header.dims.iter().map(|&d| d as usize).collect(),
            });
        };

        let chunks = samples_buf.chunks_exact(4);
        if !chunks.remainder().is_empty() {
            return Err(LoadError::TrailingBytes(chunks.remainder().len()));
        }
        let samples: Vec<f32> = chunks
            .map(|bs| f32::from_be_bytes([bs[0], bs[1], bs[2], bs[3]]))
            .collect();

        if samples.len() != expected {
            return Err(LoadError::SampleCount {
                expected,
                found: samples.len(),
            });
        }
        debug!(
            "read tensor file {:?}: dims {:?}, {} frames",
            header.label, header.dims, header.frames
        );
        Ok(TensorFile { header, samples })
    }

    fn grid_shape(&self) -> Result<Shape, LoadError> {
        Shape::from_dims(&self.dims()).map_err(|_| LoadError::BadShape {
            what: "grid tensor".to_string(),
            dims: self.dims(),
        })
    }

    /// Splits the file into its frames.
    pub fn into_frames(self) -> Result<Vec<FeatureTensor>, LoadError> {
        let shape = self.grid_shape()?;
        if shape.is_empty() {
            return Ok((0..self.frames()).map(|_| FeatureTensor::zeros(shape)).collect());
        }
        self.samples
            .chunks(shape.len())
            .map(|c| FeatureTensor::from_vec(shape, c.to_vec()).map_err(LoadError::from))
            .collect()
    }

    /// The one frame in the file.
    pub fn into_tensor(self) -> Result<FeatureTensor, LoadError> {
        if self.frames() != 1 {
            return Err(LoadError::BadShape {
                what: "single frame".to_string(),
                dims: vec![self.frames()],
            });
        }
        let shape = self.grid_shape()?;
        Ok(FeatureTensor::from_vec(shape, self.samples)?)
    }

    /// Reads `self` as weights of shape `(out, in x in_rotations, 7)` and
    /// `bias` as a vector of `out` values.
    pub fn into_kernel(self, bias: TensorFile, in_rotations: usize) -> Result<CompactKernel, LoadError> {
        let dims = self.dims();
        let planes = match dims[..] {
            [o, p, SLOTS] if in_rotations > 0 && p % in_rotations == 0 => Some((o, p)),
            _ => None,
        };
        let Some((out_channels, in_planes)) = planes else {
            return Err(LoadError::BadShape {
                what: format!("kernel weights with {} input rotations", in_rotations),
                dims,
            });
        };
        if bias.dims() != [out_channels] {
            return Err(LoadError::BadShape {
                what: format!("bias for {} output channels", out_channels),
                dims: bias.dims(),
            });
        }
        Ok(CompactKernel::new(
            out_channels,
            in_planes / in_rotations,
            in_rotations,
            self.samples,
            bias.samples,
        )?)
    }
}

/// Collects every frame it is handed and writes them out as one
/// [TensorFile] when the pipeline shuts down.
#[derive(Debug)]
pub struct TensorFileWriter {
    path: PathBuf,
    label: String,
    shape: Shape,
    frames: Vec<FeatureTensor>,
}

impl TensorFileWriter {
    /// A writer for frames of `shape`, written to `path` at the end.
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>, shape: Shape) -> Self {
        TensorFileWriter {
            path: path.into(),
            label: label.into(),
            shape,
            frames: Vec::new(),
        }
    }
}

impl fmt::Display for TensorFileWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TensorFileWriter({})", self.path.display())
    }
}

impl Component for TensorFileWriter {
    type InData = Result<FeatureTensor, IcoError>;
    type OutData = Result<usize, ComponentError>;

    /// Stores the frame and answers with how many are stored so far.
    fn convert(&mut self, input: Self::InData) -> Self::OutData {
        let frame = input?;
        frame.shape().expect(self.shape, "written frame")?;
        self.frames.push(frame);
        Ok(self.frames.len())
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        let file = TensorFile::from_frames(self.label.clone(), self.shape, &self.frames)?;
        file.to_path(&self.path)?;
        info!("wrote {} frames to {}", self.frames.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
const A_FLOAT: f32 = 12.078_431;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::run_component;
    use rand::distributions::{Distribution, Uniform};
    use std::io::Cursor;
    use std::sync::mpsc::channel;

    fn small_shape() -> Shape {
        Shape {
            channels: 1,
            rotations: 1,
            charts: 5,
            rows: 2,
            cols: 4,
        }
    }

    #[test]
    fn write_and_read_path() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let path = tempfile.path();
        let data = TensorFile::from_tensor("input", &FeatureTensor::filled(small_shape(), A_FLOAT));

        data.to_path(path).unwrap();
        let read_data = TensorFile::from_path(path).unwrap();
        assert_eq!(data, read_data);
        assert_eq!(read_data.label(), "input");
    }

    #[test]
    fn write_and_read_cursor() {
        let mut buf = Cursor::new(Vec::new());
        let data = TensorFile::from_values("bias", &[4], vec![A_FLOAT; 4]).unwrap();

        data.to_file(&mut buf).unwrap();
        buf.set_position(0);
        let read_data = TensorFile::from_file(&mut buf).unwrap();
        assert_eq!(data, read_data);
        assert_eq!(read_data.dims(), vec![4]);
    }

    #[test]
    fn frames_come_back_in_order() {
        let frames: Vec<FeatureTensor> = (0..3)
            .map(|f| FeatureTensor::filled(small_shape(), f as f32))
            .collect();
        let data = TensorFile::from_frames("clip", small_shape(), &frames).unwrap();
        assert_eq!(data.frames(), 3);
        assert_eq!(data.into_frames().unwrap(), frames);
    }

    #[test]
    fn missing_delimiter() {
        let mut buf = Cursor::new(b"(label:\"x\",dims:[1],frames:1)".to_vec());
        assert!(matches!(TensorFile::from_file(&mut buf), Err(LoadError::NoDelimiter)));
    }

    #[test]
    fn truncated_samples_are_rejected() {
        let mut raw = Vec::new();
        TensorFile::from_values("x", &[3], vec![1.0, 2.0, 3.0])
            .unwrap()
            .to_file(&mut raw)
            .unwrap();
        raw.pop();
        assert!(matches!(TensorFile::from_bytes(&raw), Err(LoadError::TrailingBytes(3))));
        raw.truncate(raw.len() - 3);
        assert!(matches!(
            TensorFile::from_bytes(&raw),
            Err(LoadError::SampleCount { expected: 3, found: 2 })
        ));
    }

    fn raw_header(header: &str) -> Vec<u8> {
        let mut raw = header.as_bytes().to_vec();
        raw.push(0xFF);
        raw
    }

    #[test]
    fn empty_frames_are_capped() {
        let raw = raw_header("(label:\"x\",dims:[0],frames:1000000000000000000)");
        assert!(matches!(TensorFile::from_bytes(&raw), Err(LoadError::BadShape { .. })));

        let raw = raw_header(&format!("(label:\"x\",dims:[0],frames:{})", MAX_FRAMES + 1));
        assert!(matches!(TensorFile::from_bytes(&raw), Err(LoadError::BadShape { .. })));

        let raw = raw_header("(label:\"x\",dims:[0],frames:4)");
        let file = TensorFile::from_bytes(&raw).unwrap();
        assert_eq!(file.frames(), 4);
        assert!(file.samples().is_empty());
    }

    #[test]
    fn overflowing_dims_are_rejected() {
        let raw = raw_header("(label:\"x\",dims:[4294967296,4294967296],frames:1)");
        assert!(matches!(TensorFile::from_bytes(&raw), Err(LoadError::BadShape { .. })));

        let raw = raw_header("(label:\"x\",dims:[4611686018427387904],frames:8)");
        assert!(matches!(TensorFile::from_bytes(&raw), Err(LoadError::BadShape { .. })));
    }

    #[test]
    fn kernels_load_with_their_bias() {
        let weights = TensorFile::from_values("w", &[2, 6, SLOTS], vec![0.5; 2 * 6 * SLOTS]).unwrap();
        let bias = TensorFile::from_values("b", &[2], vec![1.0, -1.0]).unwrap();
        let kernel = weights.clone().into_kernel(bias.clone(), 6).unwrap();
        assert_eq!(kernel.in_channels(), 1);
        assert_eq!(kernel.in_rotations(), 6);
        assert_eq!(kernel.bias(), &[1.0f32, -1.0][..]);

        let kernel = weights.clone().into_kernel(bias.clone(), 1).unwrap();
        assert_eq!(kernel.in_channels(), 6);

        let short_bias = TensorFile::from_values("b", &[3], vec![0.0; 3]).unwrap();
        assert!(matches!(
            weights.into_kernel(short_bias, 1),
            Err(LoadError::BadShape { .. })
        ));
    }

    #[test]
    fn rank_must_be_five_for_grid_tensors() {
        let data = TensorFile::from_values("x", &[2, 3], vec![0.0; 6]).unwrap();
        assert!(matches!(data.into_tensor(), Err(LoadError::BadShape { .. })));
    }

    #[test]
    fn long_write_read() {
        let rng = rand::thread_rng();
        let dist = Uniform::new(-100.0, 100.0);
        let v: Vec<f32> = dist.sample_iter(rng).take(1000000).collect();
        let mut buf = Cursor::new(Vec::new());
        let data = TensorFile::from_values("noise", &[1000, 1000], v).unwrap();

        data.to_file(&mut buf).unwrap();
        buf.set_position(0);
        let read_data = TensorFile::from_file(&mut buf).unwrap();
        assert_eq!(data, read_data);
    }

    #[test]
    fn writer_component_writes_on_finalize() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let writer = TensorFileWriter::new(tempfile.path(), "out", small_shape());
        let (test_tx, writer_rx) = channel();
        let (writer_tx, test_rx) = channel();
        let handle = run_component(Box::new(writer), writer_rx, writer_tx);

        for f in 0..4 {
            test_tx.send(Ok(FeatureTensor::filled(small_shape(), f as f32))).unwrap();
            assert_eq!(test_rx.recv().unwrap().unwrap(), f + 1);
        }
        test_tx
            .send(Err(IcoError::Configuration("bad frame".to_string())))
            .unwrap();
        assert!(matches!(test_rx.recv().unwrap(), Err(ComponentError::Engine(_))));
        drop(test_tx);
        handle.join().unwrap();

        let frames = TensorFile::from_path(tempfile.path()).unwrap().into_frames().unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3].data()[0], 3.0);
    }
}
