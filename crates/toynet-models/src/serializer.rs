// SPDX-License-Identifier: AGPL-3.0-only

//! Checkpoint → weight blob
//!
//! Per layer, in the fixed stream order:
//!
//! - conv: weight flattened `[out, in, kh, kw]`, no bias
//! - batch norm: folded `scale = γ / sqrt(σ² + ε)`, then `β`, then `μ`
//! - linear: weight flattened `[out, in]`, then bias
//!
//! The running length after the last layer must equal the architecture's
//! blob length; otherwise nothing is produced.

use crate::checkpoint::{spec_kind, Checkpoint, LayerParams};
use crate::error::{ModelError, Result};
use toynet_chip::arch::{blob_len, LayerSpec, REFERENCE_LAYERS};
use toynet_driver::WeightBlob;
use tracing::debug;

/// Batch norm reduced to what the accelerator applies
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedBatchNorm {
    /// γ / sqrt(σ² + ε)
    pub scale: Vec<f32>,
    /// β
    pub bias: Vec<f32>,
    /// μ
    pub mean: Vec<f32>,
}

/// Fold batch-norm statistics into scale, bias and mean.
///
/// # Errors
///
/// Returns `ShapeMismatch` if the four vectors differ in length.
pub fn fold_batch_norm(gamma: &[f32], beta: &[f32], mean: &[f32], var: &[f32], eps: f32) -> Result<FoldedBatchNorm> {
    let n = gamma.len();
    for (what, v) in [("beta", beta), ("running_mean", mean), ("running_var", var)] {
        if v.len() != n {
            return Err(ModelError::shape_mismatch(format!("batch norm {what}"), &[n], &[v.len()]));
        }
    }
    let scale = gamma
        .iter()
        .zip(var)
        .map(|(&g, &v)| g * (v + eps).sqrt().recip())
        .collect();
    Ok(FoldedBatchNorm {
        scale,
        bias: beta.to_vec(),
        mean: mean.to_vec(),
    })
}

/// Where one layer sits in the weight stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerOffset {
    /// Layer identifier
    pub name: &'static str,
    /// Kind tag
    pub kind: &'static str,
    /// First word
    pub offset: usize,
    /// Word count
    pub len: usize,
}

/// Serializes checkpoints for one architecture
#[derive(Debug, Clone, Copy)]
pub struct WeightSerializer {
    layers: &'static [LayerSpec],
}

impl Default for WeightSerializer {
    fn default() -> Self {
        Self::reference()
    }
}

impl WeightSerializer {
    /// Serializer for the reference ToyNet layout
    pub const fn reference() -> Self {
        Self {
            layers: &REFERENCE_LAYERS,
        }
    }

    /// Serializer for a custom layer list
    pub const fn new(layers: &'static [LayerSpec]) -> Self {
        Self { layers }
    }

    /// Words the serialized blob must have
    pub const fn expected_len(&self) -> usize {
        blob_len(self.layers)
    }

    /// Stream layout: offset and length of every layer
    pub fn layout(&self) -> Vec<LayerOffset> {
        let mut offset = 0;
        self.layers
            .iter()
            .map(|spec| {
                let entry = LayerOffset {
                    name: spec.name(),
                    kind: spec_kind(spec),
                    offset,
                    len: spec.param_len(),
                };
                offset += entry.len;
                entry
            })
            .collect()
    }

    /// Build the blob from `checkpoint`.
    ///
    /// # Errors
    ///
    /// Returns error if a layer is missing, has the wrong kind or shape, or
    /// the total length differs from [`Self::expected_len`].
    pub fn serialize(&self, checkpoint: &Checkpoint) -> Result<WeightBlob> {
        let mut data = Vec::with_capacity(self.expected_len());
        for spec in self.layers {
            let params = checkpoint.layer(spec.name())?;
            let before = data.len();
            append_layer(&mut data, spec, params)?;
            debug!("{}: {} words at offset {before}", spec.name(), data.len() - before);
        }
        Ok(WeightBlob::new(data, self.expected_len())?)
    }
}

fn append_layer(out: &mut Vec<f32>, spec: &LayerSpec, params: &LayerParams) -> Result<()> {
    let name = spec.name();
    match (*spec, params) {
        (
            LayerSpec::Conv2d {
                out_channels,
                in_channels,
                kernel,
                ..
            },
            LayerParams::Conv2d { weight },
        ) => {
            weight.expect_shape(&format!("{name}.weight"), &[out_channels, in_channels, kernel, kernel])?;
            out.extend_from_slice(weight.flatten());
        }
        (
            LayerSpec::BatchNorm2d { features, .. },
            LayerParams::BatchNorm2d {
                weight,
                bias,
                running_mean,
                running_var,
                eps,
            },
        ) => {
            for (field, t) in [
                ("weight", weight),
                ("bias", bias),
                ("running_mean", running_mean),
                ("running_var", running_var),
            ] {
                t.expect_shape(&format!("{name}.{field}"), &[features])?;
            }
            let folded = fold_batch_norm(
                weight.flatten(),
                bias.flatten(),
                running_mean.flatten(),
                running_var.flatten(),
                *eps,
            )?;
            out.extend_from_slice(&folded.scale);
            out.extend_from_slice(&folded.bias);
            out.extend_from_slice(&folded.mean);
        }
        (
            LayerSpec::Linear {
                in_features,
                out_features,
                ..
            },
            LayerParams::Linear { weight, bias },
        ) => {
            weight.expect_shape(&format!("{name}.weight"), &[out_features, in_features])?;
            bias.expect_shape(&format!("{name}.bias"), &[out_features])?;
            out.extend_from_slice(weight.flatten());
            out.extend_from_slice(bias.flatten());
        }
        (spec, params) => {
            return Err(ModelError::WrongKind {
                name: name.to_string(),
                expected: spec_kind(&spec),
                found: params.kind(),
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use toynet_driver::ToyNetError;

    #[test]
    fn reference_blob_length() {
        let blob = WeightSerializer::reference().serialize(&Checkpoint::zeros()).unwrap();
        assert_eq!(blob.len(), 61_750);
        assert_eq!(
            150 + 18 + 2400 + 48 + 48_000 + 120 + 10_080 + 84 + 840 + 10,
            WeightSerializer::reference().expected_len()
        );
    }

    #[test]
    fn fold_within_tolerance() {
        let gamma = [0.5, 1.5, -2.0, 3.25];
        let beta = [0.1, -0.2, 0.3, 0.0];
        let mean = [0.0, 1.0, -1.0, 0.25];
        let var = [1.0, 0.04, 9.0, 0.5];
        let eps = 1e-5;
        let folded = fold_batch_norm(&gamma, &beta, &mean, &var, eps).unwrap();
        for i in 0..4 {
            let recovered = folded.scale[i] * (var[i] + eps).sqrt();
            assert!(((recovered - gamma[i]) / gamma[i]).abs() < 1e-6, "{i}: {recovered}");
        }
        assert_eq!(folded.bias, beta);
        assert_eq!(folded.mean, mean);
    }

    #[test]
    fn fold_length_mismatch() {
        assert!(fold_batch_norm(&[1.0, 1.0], &[0.0], &[0.0, 0.0], &[1.0, 1.0], 1e-5).is_err());
    }

    #[test]
    fn stream_order_and_offsets() {
        let mut ckpt = Checkpoint::zeros();
        let mut conv1 = vec![0.0; 2400];
        conv1[0] = 7.0;
        ckpt.insert(
            "conv1",
            LayerParams::Conv2d {
                weight: Tensor::new(vec![16, 6, 5, 5], conv1).unwrap(),
            },
        );
        ckpt.insert(
            "bn0",
            LayerParams::BatchNorm2d {
                weight: Tensor::full(&[6], 2.0),
                bias: Tensor::full(&[6], 0.5),
                running_mean: Tensor::full(&[6], 0.25),
                running_var: Tensor::full(&[6], 4.0),
                eps: 0.0,
            },
        );
        let serializer = WeightSerializer::reference();
        let blob = serializer.serialize(&ckpt).unwrap();
        let layout = serializer.layout();
        let at = |name: &str| layout.iter().find(|l| l.name == name).unwrap().offset;

        let data = blob.as_slice();
        assert_eq!(at("bn0"), 150);
        assert_eq!(data[at("bn0")], 1.0); // 2 / sqrt(4)
        assert_eq!(data[at("bn0") + 6], 0.5);
        assert_eq!(data[at("bn0") + 12], 0.25);
        assert_eq!(data[at("conv1")], 7.0);
        assert_eq!(at("fc2") + 850, 61_750);
    }

    #[test]
    fn wrong_shape_rejected() {
        let mut ckpt = Checkpoint::zeros();
        ckpt.insert(
            "fc1",
            LayerParams::Linear {
                weight: Tensor::zeros(&[120, 84]),
                bias: Tensor::zeros(&[84]),
            },
        );
        let err = WeightSerializer::reference().serialize(&ckpt).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn wrong_kind_rejected() {
        let mut ckpt = Checkpoint::zeros();
        ckpt.insert(
            "bn1",
            LayerParams::Conv2d {
                weight: Tensor::zeros(&[16]),
            },
        );
        assert!(matches!(
            WeightSerializer::reference().serialize(&ckpt),
            Err(ModelError::WrongKind { .. })
        ));
    }

    #[test]
    fn missing_layer_rejected() {
        let mut ckpt = Checkpoint::zeros();
        ckpt.layers.remove("fc0");
        assert!(matches!(
            WeightSerializer::reference().serialize(&ckpt),
            Err(ModelError::MissingLayer { .. })
        ));
    }

    #[test]
    fn total_length_checked_against_architecture() {
        static SHORT: [LayerSpec; 1] = [LayerSpec::Linear {
            name: "fc2",
            in_features: 84,
            out_features: 10,
        }];
        // A custom layer list still serializes to its own expected length
        let blob = WeightSerializer::new(&SHORT).serialize(&Checkpoint::zeros()).unwrap();
        assert_eq!(blob.len(), 850);
        // but the reference blob constructor refuses it
        let err = WeightBlob::reference(blob.as_slice().to_vec()).unwrap_err();
        assert!(matches!(err, ToyNetError::Layout { .. }));
    }
}
