// SPDX-License-Identifier: AGPL-3.0-only

//! Validated weight blob
//!
//! A [`WeightBlob`] can only be built with exactly the number of words the
//! architecture requires, so a blob that reaches a DMA channel is never
//! short or long.

use crate::error::{Result, ToyNetError};
use toynet_chip::arch::WEIGHT_BLOB_LEN;

/// Flattened accelerator parameters in wire order
#[derive(Debug, Clone, PartialEq)]
pub struct WeightBlob {
    data: Vec<f32>,
}

impl WeightBlob {
    /// Wrap `data` after checking it against `expected_len`.
    ///
    /// # Errors
    ///
    /// Returns a layout error if the length differs.
    pub fn new(data: Vec<f32>, expected_len: usize) -> Result<Self> {
        if data.len() != expected_len {
            tracing::warn!(
                "Rejecting weight blob: {} words, architecture needs {}",
                data.len(),
                expected_len
            );
            return Err(ToyNetError::layout("weight blob", expected_len, data.len()));
        }
        Ok(Self { data })
    }

    /// Wrap `data` for the reference architecture (61,750 words).
    ///
    /// # Errors
    ///
    /// Returns a layout error if the length differs.
    pub fn reference(data: Vec<f32>) -> Result<Self> {
        Self::new(data, WEIGHT_BLOB_LEN)
    }

    /// Number of words
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the architecture has no parameters
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parameters as floats
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Parameters as raw stream words (IEEE-754 bit patterns)
    pub fn words(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.data.iter().map(|v| v.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_length_accepted() {
        let blob = WeightBlob::reference(vec![0.5; WEIGHT_BLOB_LEN]).unwrap();
        assert_eq!(blob.len(), 61_750);
        assert_eq!(blob.words().next(), Some(0.5f32.to_bits()));
    }

    #[test]
    fn short_blob_is_layout_error() {
        let err = WeightBlob::reference(vec![0.0; WEIGHT_BLOB_LEN - 1]).unwrap_err();
        assert!(matches!(
            err,
            ToyNetError::Layout {
                expected: 61_750,
                actual: 61_749,
                ..
            }
        ));
    }
}
