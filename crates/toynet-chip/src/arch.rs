// SPDX-License-Identifier: AGPL-3.0-only

//! Reference network layout as seen by the accelerator.
//!
//! The accelerator reads its parameters as one flat stream of 32-bit words in
//! the order of [`REFERENCE_LAYERS`]. Reordering layers, or changing any
//! shape, changes the wire contract.
//!
//! ```text
//! layer   kind          shape           words
//! conv0   conv2d        6×1×5×5           150
//! bn0     batch_norm2d  3×6                18
//! conv1   conv2d        16×6×5×5         2400
//! bn1     batch_norm2d  3×16               48
//! fc0     linear        120×400 + 120   48120
//! fc1     linear        84×120 + 84     10164
//! fc2     linear        10×84 + 10        850
//!                                       -----
//!                                       61750
//! ```

/// Input channels of one sample.
pub const INPUT_CHANNELS: usize = 1;
/// Input height in pixels.
pub const INPUT_HEIGHT: usize = 28;
/// Input width in pixels.
pub const INPUT_WIDTH: usize = 28;
/// Words per flattened input sample (row-major pixels).
pub const SAMPLE_LEN: usize = INPUT_CHANNELS * INPUT_HEIGHT * INPUT_WIDTH;
/// Output classes (words per output vector).
pub const NUM_CLASSES: usize = 10;

/// Words in the serialized weight blob of the reference architecture.
pub const WEIGHT_BLOB_LEN: usize = 61_750;

/// Parameterised layer as it appears in the weight stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec {
    /// 2D convolution without bias, weight in (out, in, kh, kw) order.
    Conv2d {
        /// Layer identifier
        name: &'static str,
        /// Output channels
        out_channels: usize,
        /// Input channels
        in_channels: usize,
        /// Square kernel size
        kernel: usize,
    },
    /// Batch normalization folded to scale, bias, mean.
    BatchNorm2d {
        /// Layer identifier
        name: &'static str,
        /// Feature (channel) count
        features: usize,
    },
    /// Fully connected layer, weight in (out, in) order followed by bias.
    Linear {
        /// Layer identifier
        name: &'static str,
        /// Input features
        in_features: usize,
        /// Output features
        out_features: usize,
    },
}

impl LayerSpec {
    /// Layer identifier (checkpoint key).
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Conv2d { name, .. } | Self::BatchNorm2d { name, .. } | Self::Linear { name, .. } => name,
        }
    }

    /// Words this layer contributes to the weight blob.
    pub const fn param_len(&self) -> usize {
        match *self {
            Self::Conv2d {
                out_channels,
                in_channels,
                kernel,
                ..
            } => out_channels * in_channels * kernel * kernel,
            Self::BatchNorm2d { features, .. } => 3 * features,
            Self::Linear {
                in_features,
                out_features,
                ..
            } => out_features * in_features + out_features,
        }
    }
}

/// Layer order of the weight stream.
pub const REFERENCE_LAYERS: [LayerSpec; 7] = [
    LayerSpec::Conv2d {
        name: "conv0",
        out_channels: 6,
        in_channels: 1,
        kernel: 5,
    },
    LayerSpec::BatchNorm2d {
        name: "bn0",
        features: 6,
    },
    LayerSpec::Conv2d {
        name: "conv1",
        out_channels: 16,
        in_channels: 6,
        kernel: 5,
    },
    LayerSpec::BatchNorm2d {
        name: "bn1",
        features: 16,
    },
    LayerSpec::Linear {
        name: "fc0",
        in_features: 400,
        out_features: 120,
    },
    LayerSpec::Linear {
        name: "fc1",
        in_features: 120,
        out_features: 84,
    },
    LayerSpec::Linear {
        name: "fc2",
        in_features: 84,
        out_features: 10,
    },
];

/// Sum of [`LayerSpec::param_len`] over `layers`.
pub const fn blob_len(layers: &[LayerSpec]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < layers.len() {
        total += layers[i].param_len();
        i += 1;
    }
    total
}

const _: () = assert!(blob_len(&REFERENCE_LAYERS) == WEIGHT_BLOB_LEN);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_blob_is_61750_words() {
        let parts: Vec<usize> = REFERENCE_LAYERS.iter().map(LayerSpec::param_len).collect();
        assert_eq!(parts, vec![150, 18, 2400, 48, 48_120, 10_164, 850]);
        assert_eq!(blob_len(&REFERENCE_LAYERS), WEIGHT_BLOB_LEN);
    }

    #[test]
    fn layer_names_are_fixed() {
        let names: Vec<&str> = REFERENCE_LAYERS.iter().map(LayerSpec::name).collect();
        assert_eq!(names, ["conv0", "bn0", "conv1", "bn1", "fc0", "fc1", "fc2"]);
    }

    #[test]
    fn sample_geometry() {
        assert_eq!(SAMPLE_LEN, 784);
        assert_eq!(NUM_CLASSES, 10);
    }
}
