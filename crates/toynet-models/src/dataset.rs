// SPDX-License-Identifier: AGPL-3.0-only

//! MNIST test set in IDX format
//!
//! ```text
//! images: u32 magic 0x00000803 | u32 count | u32 rows | u32 cols | count×rows×cols u8
//! labels: u32 magic 0x00000801 | u32 count | count u8
//! ```
//!
//! All header fields are big-endian. Pixels are scaled to [0, 1] and then
//! normalized with the mean and standard deviation the weights were trained
//! against.

use crate::error::{ModelError, Result};
use bytes::{Buf, Bytes};
use std::path::Path;
use toynet_chip::arch::{INPUT_HEIGHT, INPUT_WIDTH, SAMPLE_LEN};

/// Normalization mean
pub const MNIST_MEAN: f32 = 0.1307;
/// Normalization standard deviation
pub const MNIST_STD: f32 = 0.3081;

/// Test-set image file name
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
/// Test-set label file name
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 0x0803;
const LABELS_MAGIC: u32 = 0x0801;

/// Scale a pixel to [0, 1] and normalize it
pub fn normalize(pixel: u8) -> f32 {
    (f32::from(pixel) / 255.0 - MNIST_MEAN) / MNIST_STD
}

/// Labelled 28×28 samples
#[derive(Debug, Clone)]
pub struct Dataset {
    pixels: Bytes,
    labels: Bytes,
}

impl Dataset {
    /// Open the MNIST test files in `dir`.
    ///
    /// # Errors
    ///
    /// Returns error if either file is missing or malformed.
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| -> Result<Bytes> {
            let path = dir.join(name);
            if !path.exists() {
                return Err(ModelError::FileNotFound { path });
            }
            Ok(Bytes::from(std::fs::read(&path)?))
        };
        let dataset = Self::from_idx(read(TEST_IMAGES)?, read(TEST_LABELS)?)?;
        tracing::info!("Loaded {} samples from {}", dataset.len(), dir.display());
        Ok(dataset)
    }

    /// Parse IDX image and label buffers.
    ///
    /// # Errors
    ///
    /// Returns `Dataset` error on a bad magic number, non-28×28 images, a
    /// count mismatch, or truncated payload.
    pub fn from_idx(mut images: Bytes, mut labels: Bytes) -> Result<Self> {
        if images.remaining() < 16 || labels.remaining() < 8 {
            return Err(ModelError::dataset("truncated IDX header"));
        }

        let magic = images.get_u32();
        if magic != IMAGES_MAGIC {
            return Err(ModelError::dataset(format!("image magic {magic:#010x}, expected {IMAGES_MAGIC:#010x}")));
        }
        let count = images.get_u32() as usize;
        let rows = images.get_u32() as usize;
        let cols = images.get_u32() as usize;
        if (rows, cols) != (INPUT_HEIGHT, INPUT_WIDTH) {
            return Err(ModelError::dataset(format!(
                "images are {rows}×{cols}, expected {INPUT_HEIGHT}×{INPUT_WIDTH}"
            )));
        }

        let magic = labels.get_u32();
        if magic != LABELS_MAGIC {
            return Err(ModelError::dataset(format!("label magic {magic:#010x}, expected {LABELS_MAGIC:#010x}")));
        }
        let label_count = labels.get_u32() as usize;
        if label_count != count {
            return Err(ModelError::dataset(format!("{count} images but {label_count} labels")));
        }

        if images.remaining() < count * SAMPLE_LEN || labels.remaining() < count {
            return Err(ModelError::dataset(format!("payload shorter than {count} samples")));
        }
        Ok(Self {
            pixels: images.split_to(count * SAMPLE_LEN),
            labels: labels.split_to(count),
        })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if the set is empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Label of sample `index`
    pub fn label(&self, index: usize) -> Option<u8> {
        self.labels.get(index).copied()
    }

    /// Normalized pixels of sample `index`
    pub fn sample(&self, index: usize) -> Option<Vec<f32>> {
        self.pixels
            .get(index * SAMPLE_LEN..(index + 1) * SAMPLE_LEN)
            .map(|px| px.iter().copied().map(normalize).collect())
    }

    /// Keep only the first `n` samples
    #[must_use]
    pub fn truncate(mut self, n: usize) -> Self {
        let n = n.min(self.len());
        self.pixels.truncate(n * SAMPLE_LEN);
        self.labels.truncate(n);
        self
    }

    /// Iterate over `(normalized sample, label)` in file order
    pub fn iter(&self) -> impl Iterator<Item = (Vec<f32>, u8)> + '_ {
        self.pixels
            .chunks_exact(SAMPLE_LEN)
            .zip(self.labels.iter().copied())
            .map(|(px, label)| (px.iter().copied().map(normalize).collect(), label))
    }
}
