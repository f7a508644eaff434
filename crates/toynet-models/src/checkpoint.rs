// SPDX-License-Identifier: AGPL-3.0-only

//! Trained parameters keyed by layer name
//!
//! Stored as JSON:
//!
//! ```json
//! {"layers": {
//!   "conv0": {"kind": "conv2d", "weight": {"shape": [6,1,5,5], "data": [...]}},
//!   "bn0":   {"kind": "batch_norm2d", "weight": {...}, "bias": {...},
//!             "running_mean": {...}, "running_var": {...}, "eps": 1e-5},
//!   "fc0":   {"kind": "linear", "weight": {...}, "bias": {...}},
//!   ...
//! }}
//! ```

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use toynet_chip::arch::{LayerSpec, REFERENCE_LAYERS};

/// Default batch-norm epsilon
pub const DEFAULT_BN_EPS: f32 = 1e-5;

const fn default_eps() -> f32 {
    DEFAULT_BN_EPS
}

/// Parameters of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum LayerParams {
    /// Bias-free convolution, weight `[out, in, kh, kw]`
    Conv2d {
        /// Kernel weights
        weight: Tensor,
    },
    /// Batch normalization with running statistics
    BatchNorm2d {
        /// γ
        weight: Tensor,
        /// β
        bias: Tensor,
        /// Running mean μ
        running_mean: Tensor,
        /// Running variance σ²
        running_var: Tensor,
        /// ε
        #[serde(default = "default_eps")]
        eps: f32,
    },
    /// Fully connected, weight `[out, in]`
    Linear {
        /// Weight matrix
        weight: Tensor,
        /// Bias vector
        bias: Tensor,
    },
}

impl LayerParams {
    /// Kind tag as written in the checkpoint
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "conv2d",
            Self::BatchNorm2d { .. } => "batch_norm2d",
            Self::Linear { .. } => "linear",
        }
    }

    /// Zero parameters shaped for `spec` (running variance 1)
    pub fn zeros_for(spec: &LayerSpec) -> Self {
        match *spec {
            LayerSpec::Conv2d {
                out_channels,
                in_channels,
                kernel,
                ..
            } => Self::Conv2d {
                weight: Tensor::zeros(&[out_channels, in_channels, kernel, kernel]),
            },
            LayerSpec::BatchNorm2d { features, .. } => Self::BatchNorm2d {
                weight: Tensor::zeros(&[features]),
                bias: Tensor::zeros(&[features]),
                running_mean: Tensor::zeros(&[features]),
                running_var: Tensor::full(&[features], 1.0),
                eps: DEFAULT_BN_EPS,
            },
            LayerSpec::Linear {
                in_features,
                out_features,
                ..
            } => Self::Linear {
                weight: Tensor::zeros(&[out_features, in_features]),
                bias: Tensor::zeros(&[out_features]),
            },
        }
    }
}

/// Kind tag `spec` requires
pub(crate) const fn spec_kind(spec: &LayerSpec) -> &'static str {
    match spec {
        LayerSpec::Conv2d { .. } => "conv2d",
        LayerSpec::BatchNorm2d { .. } => "batch_norm2d",
        LayerSpec::Linear { .. } => "linear",
    }
}

/// Layer name → parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Parameters per layer
    pub layers: BTreeMap<String, LayerParams>,
}

impl Checkpoint {
    /// Load a checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or not a valid checkpoint.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading checkpoint from: {}", path.display());
        if !path.exists() {
            return Err(ModelError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read(path)?;
        Self::from_json_slice(&text)
    }

    /// Parse JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `Parse` error on malformed input.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let checkpoint: Self = serde_json::from_slice(bytes).map_err(|e| ModelError::parse(e.to_string()))?;
        tracing::debug!("Checkpoint layers: {:?}", checkpoint.layers.keys().collect::<Vec<_>>());
        Ok(checkpoint)
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Parse` error if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ModelError::parse(e.to_string()))
    }

    /// Write to `path` as JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// All-zero parameters for the reference architecture.
    ///
    /// Every class score comes out 0 for every input, so the post-softmax
    /// distribution is uniform.
    pub fn zeros() -> Self {
        Self {
            layers: REFERENCE_LAYERS
                .iter()
                .map(|spec| (spec.name().to_string(), LayerParams::zeros_for(spec)))
                .collect(),
        }
    }

    /// Parameters of layer `name`.
    ///
    /// # Errors
    ///
    /// Returns `MissingLayer` if absent.
    pub fn layer(&self, name: &str) -> Result<&LayerParams> {
        self.layers.get(name).ok_or_else(|| ModelError::MissingLayer {
            name: name.to_string(),
        })
    }

    /// Insert or replace a layer
    pub fn insert(&mut self, name: impl Into<String>, params: LayerParams) {
        self.layers.insert(name.into(), params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_cover_reference_layers() {
        let ckpt = Checkpoint::zeros();
        assert_eq!(ckpt.layers.len(), 7);
        for spec in &REFERENCE_LAYERS {
            assert_eq!(ckpt.layer(spec.name()).unwrap().kind(), spec_kind(spec));
        }
    }

    #[test]
    fn parses_tagged_layers() {
        let json = r#"{"layers": {
            "bn0": {"kind": "batch_norm2d",
                    "weight": {"shape": [1], "data": [2.0]},
                    "bias": {"shape": [1], "data": [0.5]},
                    "running_mean": {"shape": [1], "data": [0.1]},
                    "running_var": {"shape": [1], "data": [4.0]}},
            "fc2": {"kind": "linear",
                    "weight": {"shape": [1, 2], "data": [1.0, 2.0]},
                    "bias": {"shape": [1], "data": [3.0]}}
        }}"#;
        let ckpt = Checkpoint::from_json_slice(json.as_bytes()).unwrap();
        match ckpt.layer("bn0").unwrap() {
            LayerParams::BatchNorm2d { eps, .. } => assert_eq!(*eps, DEFAULT_BN_EPS),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ckpt.layer("fc2").unwrap().kind(), "linear");
        assert!(matches!(ckpt.layer("conv0"), Err(ModelError::MissingLayer { .. })));
    }

    #[test]
    fn unknown_kind_rejected() {
        let json = r#"{"layers": {"x": {"kind": "lstm", "weight": {"shape": [1], "data": [0]}}}}"#;
        assert!(Checkpoint::from_json_slice(json.as_bytes()).is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toynet.json");
        let ckpt = Checkpoint::zeros();
        ckpt.save(&path).unwrap();
        assert_eq!(Checkpoint::from_file(&path).unwrap(), ckpt);
    }

    #[test]
    fn missing_file() {
        let err = Checkpoint::from_file("/nonexistent/toynet.json").unwrap_err();
        assert!(matches!(err, ModelError::FileNotFound { .. }));
    }
}
