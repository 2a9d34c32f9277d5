//! Errors raised by the engine, split in two families: [IcoError] for
//! geometry, shape, and numeric problems inside the core, and [LoadError]
//! for everything that can go wrong while reading configuration, weights,
//! or tensors from storage. Keeping them apart lets a caller tell a data
//! problem from an algorithm problem.

use std::{borrow::Cow, fmt};

/// Structural failures of the convolution engine. None of these are
/// transient, so nothing retries them.
#[derive(Debug, Clone, PartialEq)]
pub enum IcoError {
    /// An invalid resolution, channel count, rotation count, or an attempt
    /// to change the reconciliation mode after it was configured.
    Configuration(String),

    /// A tensor's axes do not agree with the configured grid.
    ShapeMismatch {
        /// What was being checked, e.g. "input tensor"
        what: &'static str,
        /// The axis sizes the grid requires
        expected: Vec<usize>,
        /// The axis sizes that were handed in
        found: Vec<usize>,
    },

    /// The adjacency table and the padding map disagree about a neighbor,
    /// or the mesh built from the charts is not an icosphere.
    TopologyInconsistency {
        /// Global id of the vertex being checked, if there is one
        vertex: Option<usize>,
        /// Neighbor slot being checked, if there is one
        slot: Option<usize>,
        /// Human readable description of the disagreement
        detail: String,
    },

    /// Two implementations produced values further apart than allowed.
    NumericDivergence {
        /// Flat index of the worst offending element
        index: usize,
        /// Value from the reference side
        expected: f32,
        /// Value from the side under test
        found: f32,
        /// Absolute difference at `index`
        magnitude: f32,
        /// The tolerance that was exceeded
        tolerance: f32,
    },
}

impl fmt::Display for IcoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use IcoError as IE;
        let msg = match self {
            IE::Configuration(why) => Cow::from(format!("configuration error: {}", why)),
            IE::ShapeMismatch {
                what,
                expected,
                found,
            } => Cow::from(format!(
                "shape mismatch for {}: expected {:?}, found {:?}",
                what, expected, found
            )),
            IE::TopologyInconsistency {
                vertex,
                slot,
                detail,
            } => Cow::from(format!(
                "topology inconsistency at vertex {:?} slot {:?}: {}",
                vertex, slot, detail
            )),
            IE::NumericDivergence {
                index,
                expected,
                found,
                magnitude,
                tolerance,
            } => Cow::from(format!(
                "numeric divergence at index {}: expected {}, found {} (|diff| {} > {})",
                index, expected, found, magnitude, tolerance
            )),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for IcoError {}

impl IcoError {
    /// Shorthand for a [IcoError::TopologyInconsistency] with no location.
    pub(crate) fn topology(detail: impl Into<String>) -> Self {
        IcoError::TopologyInconsistency {
            vertex: None,
            slot: None,
            detail: detail.into(),
        }
    }
}

/// Failures while reading or writing files. These are never raised by the
/// core itself.
#[derive(Debug)]
pub enum LoadError {
    /// Returned when io fails when reading or writing files.
    IoError(std::io::Error),

    /// Returned when serialization of a header or config fails.
    RonError(ron::Error),

    /// Returned when deserialization of a header or config fails.
    RonSpannedError(ron::de::SpannedError),

    /// Returned when a tensor file has no delimiter between header and
    /// sample binary.
    NoDelimiter,

    /// Returned when the sample section is not a whole number of f32s.
    TrailingBytes(usize),

    /// Returned when the number of stored values disagrees with the shape
    /// announced by the file.
    SampleCount {
        /// Values implied by the header
        expected: usize,
        /// Values actually present
        found: usize,
    },

    /// Returned when a text dump cannot be parsed.
    Parse(String),

    /// Returned when stored dimensions cannot be read as the requested
    /// kind of tensor.
    BadShape {
        /// What the data was going to be read as
        what: String,
        /// The dimensions that were stored
        dims: Vec<usize>,
    },

    /// Returned when loaded data is rejected by the engine.
    Rejected(IcoError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use LoadError as LE;
        let msg = match self {
            LE::IoError(error) => Cow::from(format!("io error: {}", error)),
            LE::RonError(error) => Cow::from(format!("ron error: {}", error)),
            LE::RonSpannedError(error) => Cow::from(format!("ron spanning error: {}", error)),
            LE::NoDelimiter => Cow::from("no delimiter in tensor file"),
            LE::TrailingBytes(n) => Cow::from(format!("{} trailing bytes after last f32", n)),
            LE::SampleCount { expected, found } => Cow::from(format!(
                "header announces {} values but {} are stored",
                expected, found
            )),
            LE::Parse(why) => Cow::from(format!("parse error: {}", why)),
            LE::BadShape { what, dims } => {
                Cow::from(format!("cannot read dimensions {:?} as {}", dims, what))
            }
            LE::Rejected(error) => Cow::from(format!("rejected: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

impl From<ron::Error> for LoadError {
    fn from(value: ron::Error) -> Self {
        Self::RonError(value)
    }
}

impl From<IcoError> for LoadError {
    fn from(value: IcoError) -> Self {
        Self::Rejected(value)
    }
}

impl From<ron::de::SpannedError> for LoadError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::RonSpannedError(value)
    }
}
