//! Engine configuration, stored as [ron].
//!
//! ```text
//! (
//!     resolution: 2,
//!     in_channels: 1,
//!     in_rotations: 1,
//!     out_channels: 32,
//!     out_rotations: 6,
//!     reconcile: Clean,
//!     activation: Identity,
//! )
//! ```
//!
//! `reconcile` and `activation` may be left out and default to `Clean` and
//! `Identity`. `reconcile` also takes `Smooth` or `Zero`.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{IcoError, LoadError};
use crate::padding::check_rotations;
use crate::reconcile::ReconcileMode;
use crate::topology::GridTopology;

/// Pointwise function applied after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum Activation {
    /// Leave values alone
    #[default]
    Identity,
    /// `max(x, 0)`
    Relu,
}

impl Activation {
    /// Applies the activation in place.
    pub fn apply(self, values: &mut [f32]) {
        match self {
            Activation::Identity => {}
            Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
        }
    }
}

/// Everything needed to set up one convolution layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Subdivision level `r`, so `H = 2^r`
    pub resolution: i64,
    /// Input feature channels
    pub in_channels: usize,
    /// Input rotations, 1 or 6
    pub in_rotations: usize,
    /// Output feature channels
    pub out_channels: usize,
    /// Output rotations, 1 or 6
    pub out_rotations: usize,
    /// Seam reconciliation rule, fixed for the lifetime of the engine
    #[serde(default)]
    pub reconcile: ReconcileMode,
    /// Applied to the reconciled output
    #[serde(default)]
    pub activation: Activation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            resolution: 2,
            in_channels: 1,
            in_rotations: 1,
            out_channels: 32,
            out_rotations: 6,
            reconcile: ReconcileMode::Clean,
            activation: Activation::Identity,
        }
    }
}

impl EngineConfig {
    /// Checks every field, reporting the first bad one.
    pub fn validate(&self) -> Result<(), IcoError> {
        GridTopology::new(self.resolution)?;
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(IcoError::Configuration(format!(
                "channel counts must be positive, got {} in and {} out",
                self.in_channels, self.out_channels
            )));
        }
        for rotations in [self.in_rotations, self.out_rotations] {
            check_rotations(rotations)
                .map_err(|_| IcoError::Configuration(format!("rotation count {} is not 1 or 6", rotations)))?;
        }
        Ok(())
    }

    /// Parses a config from [ron] text.
    pub fn from_ron(text: &str) -> Result<Self, LoadError> {
        Ok(ron::de::from_str(text)?)
    }

    /// Reads a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Renders the config as pretty [ron].
    pub fn to_ron(&self) -> Result<String, LoadError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    /// Writes the config to `path`.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        fs::write(path, self.to_ron()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let c = EngineConfig::from_ron(
            "(resolution: 3, in_channels: 4, in_rotations: 1, out_channels: 8, out_rotations: 6)",
        )
        .unwrap();
        assert_eq!(c.reconcile, ReconcileMode::Clean);
        assert_eq!(c.activation, Activation::Identity);
        assert_eq!(c.resolution, 3);
        c.validate().unwrap();
    }

    #[test]
    fn write_and_read_path() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let c = EngineConfig {
            reconcile: ReconcileMode::Smooth,
            activation: Activation::Relu,
            ..EngineConfig::default()
        };
        c.to_path(tempfile.path()).unwrap();
        assert_eq!(EngineConfig::from_path(tempfile.path()).unwrap(), c);
    }

    #[test]
    fn validation_catches_bad_fields() {
        let bad = [
            EngineConfig {
                resolution: -1,
                ..EngineConfig::default()
            },
            EngineConfig {
                out_rotations: 3,
                ..EngineConfig::default()
            },
            EngineConfig {
                in_channels: 0,
                ..EngineConfig::default()
            },
        ];
        for c in bad {
            assert!(matches!(c.validate(), Err(IcoError::Configuration(_))), "{:?}", c);
        }
    }

    #[test]
    fn malformed_text_is_a_load_error() {
        assert!(matches!(
            EngineConfig::from_ron("(resolution: two)"),
            Err(LoadError::RonSpannedError(_))
        ));
    }

    #[test]
    fn relu_clamps_negatives() {
        let mut v = [-1.0, 0.5, 0.0, -0.0];
        Activation::Relu.apply(&mut v);
        assert_eq!(v, [0.0, 0.5, 0.0, 0.0]);
    }
}
