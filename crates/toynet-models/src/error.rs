// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for parameter and dataset handling

use std::path::PathBuf;
use thiserror::Error;
use toynet_driver::ToyNetError;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur while preparing weights or data
#[derive(Debug, Error)]
pub enum ModelError {
    /// File not found or cannot be read
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// Checkpoint text could not be parsed
    #[error("Failed to parse checkpoint: {reason}")]
    Parse {
        /// Reason for failure
        reason: String,
    },

    /// Checkpoint lacks a layer the architecture needs
    #[error("Checkpoint has no layer {name:?}")]
    MissingLayer {
        /// Layer identifier
        name: String,
    },

    /// Layer present with the wrong kind
    #[error("Layer {name:?}: expected {expected}, found {found}")]
    WrongKind {
        /// Layer identifier
        name: String,
        /// Kind the architecture needs
        expected: &'static str,
        /// Kind found in the checkpoint
        found: &'static str,
    },

    /// Tensor shape differs from what the architecture needs
    #[error("{context}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor description
        context: String,
        /// Required shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dataset file malformed
    #[error("Invalid dataset: {reason}")]
    Dataset {
        /// Reason for failure
        reason: String,
    },

    /// Output and label counts differ
    #[error("{outputs} outputs but {labels} labels")]
    LabelCount {
        /// Output vectors received
        outputs: usize,
        /// Labels supplied
        labels: usize,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Error raised by the driver (including blob layout violations)
    #[error(transparent)]
    Driver(#[from] ToyNetError),
}

impl ModelError {
    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a dataset error
    pub fn dataset(reason: impl Into<String>) -> Self {
        Self::Dataset {
            reason: reason.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
