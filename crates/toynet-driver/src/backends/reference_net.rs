// SPDX-License-Identifier: AGPL-3.0-only

//! f32 model of the accelerator's inference kernel
//!
//! Decodes the weight stream in wire order and runs
//!
//! ```text
//! conv0 (pad 2) → maxpool 2 → bn0+ReLU → conv1 (pad 0) → maxpool 2 → bn1+ReLU
//!   → flatten → fc0+ReLU → fc1+ReLU → fc2
//! ```
//!
//! The hardware computes in fixed point; this model is the f32 reference
//! the virtual accelerator answers with.

use toynet_chip::arch::{
    LayerSpec, INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH, NUM_CLASSES, REFERENCE_LAYERS, WEIGHT_BLOB_LEN,
};

/// Padding of the convolutions, in layer order.
const CONV_PADDING: [usize; 2] = [2, 0];

/// Pooling window applied after every convolution.
const POOL: usize = 2;

#[derive(Debug, Clone)]
enum Layer {
    Conv {
        weight: Vec<f32>,
        out_channels: usize,
        in_channels: usize,
        kernel: usize,
        padding: usize,
    },
    BatchNorm {
        scale: Vec<f32>,
        bias: Vec<f32>,
        mean: Vec<f32>,
    },
    Linear {
        weight: Vec<f32>,
        bias: Vec<f32>,
        in_features: usize,
        out_features: usize,
    },
}

/// Reference network with decoded parameters
#[derive(Debug, Clone)]
pub(crate) struct ReferenceNet {
    layers: Vec<Layer>,
}

impl ReferenceNet {
    /// Network whose parameters are all zero (state before any weight load)
    pub(crate) fn zeroed() -> Self {
        Self::from_words(&[0u32; WEIGHT_BLOB_LEN]).unwrap_or(Self { layers: Vec::new() })
    }

    /// Decode a weight stream; `None` if it is not exactly one blob long.
    pub(crate) fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() != WEIGHT_BLOB_LEN {
            return None;
        }
        let mut cursor = words.iter().copied().map(f32::from_bits);
        let mut take = |n: usize| -> Vec<f32> { cursor.by_ref().take(n).collect() };

        let mut conv_index = 0;
        let layers = REFERENCE_LAYERS
            .iter()
            .map(|spec| match *spec {
                LayerSpec::Conv2d {
                    out_channels,
                    in_channels,
                    kernel,
                    ..
                } => {
                    let padding = CONV_PADDING[conv_index];
                    conv_index += 1;
                    Layer::Conv {
                        weight: take(out_channels * in_channels * kernel * kernel),
                        out_channels,
                        in_channels,
                        kernel,
                        padding,
                    }
                }
                LayerSpec::BatchNorm2d { features, .. } => Layer::BatchNorm {
                    scale: take(features),
                    bias: take(features),
                    mean: take(features),
                },
                LayerSpec::Linear {
                    in_features,
                    out_features,
                    ..
                } => Layer::Linear {
                    weight: take(out_features * in_features),
                    bias: take(out_features),
                    in_features,
                    out_features,
                },
            })
            .collect();
        Some(Self { layers })
    }

    /// Class scores for one flattened 1×28×28 sample.
    pub(crate) fn forward(&self, sample: &[f32]) -> [f32; NUM_CLASSES] {
        let mut x = sample.to_vec();
        let (mut c, mut h, mut w) = (INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH);
        let last_linear = self
            .layers
            .iter()
            .rposition(|layer| matches!(layer, Layer::Linear { .. }));

        for (index, layer) in self.layers.iter().enumerate() {
            match layer {
                Layer::Conv {
                    weight,
                    out_channels,
                    in_channels,
                    kernel,
                    padding,
                } => {
                    debug_assert_eq!(c, *in_channels);
                    let (y, oh, ow) = conv2d(&x, (c, h, w), weight, *out_channels, *kernel, *padding);
                    let (y, ph, pw) = max_pool(&y, (*out_channels, oh, ow), POOL);
                    x = y;
                    (c, h, w) = (*out_channels, ph, pw);
                }
                Layer::BatchNorm { scale, bias, mean } => {
                    let plane = h * w;
                    for (i, v) in x.iter_mut().enumerate() {
                        let ch = i / plane;
                        *v = ((*v - mean[ch]) * scale[ch] + bias[ch]).max(0.0);
                    }
                }
                Layer::Linear {
                    weight,
                    bias,
                    in_features,
                    out_features,
                } => {
                    debug_assert_eq!(x.len(), *in_features);
                    let relu = Some(index) != last_linear;
                    x = (0..*out_features)
                        .map(|o| {
                            let row = &weight[o * in_features..(o + 1) * in_features];
                            let v = row.iter().zip(&x).map(|(a, b)| a * b).sum::<f32>() + bias[o];
                            if relu {
                                v.max(0.0)
                            } else {
                                v
                            }
                        })
                        .collect();
                }
            }
        }

        let mut out = [0.0f32; NUM_CLASSES];
        for (dst, src) in out.iter_mut().zip(&x) {
            *dst = *src;
        }
        out
    }
}

fn conv2d(
    x: &[f32],
    (c, h, w): (usize, usize, usize),
    weight: &[f32],
    out_channels: usize,
    k: usize,
    p: usize,
) -> (Vec<f32>, usize, usize) {
    let oh = h + 2 * p - k + 1;
    let ow = w + 2 * p - k + 1;
    let mut y = vec![0.0f32; out_channels * oh * ow];
    for oc in 0..out_channels {
        for i in 0..oh {
            for j in 0..ow {
                let mut acc = 0.0f32;
                for ic in 0..c {
                    for kh in 0..k {
                        let Some(ih) = (i + kh).checked_sub(p).filter(|&ih| ih < h) else {
                            continue;
                        };
                        for kw in 0..k {
                            let Some(iw) = (j + kw).checked_sub(p).filter(|&iw| iw < w) else {
                                continue;
                            };
                            acc += x[(ic * h + ih) * w + iw] * weight[((oc * c + ic) * k + kh) * k + kw];
                        }
                    }
                }
                y[(oc * oh + i) * ow + j] = acc;
            }
        }
    }
    (y, oh, ow)
}

fn max_pool(x: &[f32], (c, h, w): (usize, usize, usize), k: usize) -> (Vec<f32>, usize, usize) {
    let (oh, ow) = (h / k, w / k);
    let mut y = vec![f32::NEG_INFINITY; c * oh * ow];
    for ch in 0..c {
        for i in 0..oh {
            for j in 0..ow {
                let dst = &mut y[(ch * oh + i) * ow + j];
                for kh in 0..k {
                    for kw in 0..k {
                        *dst = dst.max(x[(ch * h + i * k + kh) * w + j * k + kw]);
                    }
                }
            }
        }
    }
    (y, oh, ow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use toynet_chip::arch::SAMPLE_LEN;

    #[test]
    fn zero_weights_give_zero_scores() {
        let net = ReferenceNet::zeroed();
        let out = net.forward(&vec![0.7; SAMPLE_LEN]);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn final_bias_passes_through() {
        let mut words = vec![0u32; WEIGHT_BLOB_LEN];
        let bias_start = WEIGHT_BLOB_LEN - NUM_CLASSES;
        for (i, w) in words[bias_start..].iter_mut().enumerate() {
            *w = (i as f32 - 4.5).to_bits();
        }
        let out = ReferenceNet::from_words(&words).unwrap().forward(&vec![0.0; SAMPLE_LEN]);
        assert_eq!(out[0], -4.5);
        assert_eq!(out[9], 4.5);
    }

    #[test]
    fn wrong_length_stream_not_decoded() {
        assert!(ReferenceNet::from_words(&[0u32; 10]).is_none());
    }

    #[test]
    fn conv_same_padding_keeps_size() {
        let x = vec![1.0f32; 4 * 4];
        let weight = vec![1.0f32; 9];
        let (y, oh, ow) = conv2d(&x, (1, 4, 4), &weight, 1, 3, 1);
        assert_eq!((oh, ow), (4, 4));
        assert_eq!(y[0], 4.0);
        assert_eq!(y[5], 9.0);
    }

    #[test]
    fn pool_takes_maximum() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let (y, oh, ow) = max_pool(&x, (1, 2, 2), 2);
        assert_eq!((oh, ow), (1, 1));
        assert_eq!(y, vec![4.0]);
    }
}
