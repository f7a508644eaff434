// SPDX-License-Identifier: AGPL-3.0-only

//! Inference inputs, outputs, and per-batch metrics
//!
//! Samples travel as flattened 1×28×28 f32 values, one word per value.
//! Every sample yields exactly one ten-word score vector.

use crate::error::{Result, ToyNetError};
use std::time::Duration;
use toynet_chip::arch::{NUM_CLASSES, SAMPLE_LEN};

/// Batch of flattened input samples
#[derive(Debug, Clone, PartialEq)]
pub struct InputBatch {
    data: Vec<f32>,
}

impl InputBatch {
    /// Wrap `data`, which must hold a whole, non-zero number of samples.
    ///
    /// # Errors
    ///
    /// Returns `Layout` error if the length is not a positive multiple of
    /// the sample length.
    pub fn new(data: Vec<f32>) -> Result<Self> {
        if data.is_empty() || data.len() % SAMPLE_LEN != 0 {
            let whole = data.len().div_ceil(SAMPLE_LEN).max(1);
            return Err(ToyNetError::layout("input batch", whole * SAMPLE_LEN, data.len()));
        }
        Ok(Self { data })
    }

    /// Concatenate individual samples.
    ///
    /// # Errors
    ///
    /// Returns `Layout` error if any sample is not exactly one sample long,
    /// or if `samples` is empty.
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a [f32]>) -> Result<Self> {
        let mut data = Vec::new();
        for sample in samples {
            if sample.len() != SAMPLE_LEN {
                return Err(ToyNetError::layout("input sample", SAMPLE_LEN, sample.len()));
            }
            data.extend_from_slice(sample);
        }
        Self::new(data)
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.data.len() / SAMPLE_LEN
    }

    /// Always false for a constructed batch
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sample `index`, if present
    pub fn sample(&self, index: usize) -> Option<&[f32]> {
        self.data.get(index * SAMPLE_LEN..(index + 1) * SAMPLE_LEN)
    }

    /// All samples, back to back
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Iterate over the samples
    pub fn samples(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(SAMPLE_LEN)
    }
}

/// Raw class scores for one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputVector {
    /// Scores in class order
    pub scores: [f32; NUM_CLASSES],
}

impl OutputVector {
    /// Build from a slice of exactly ten scores.
    ///
    /// # Errors
    ///
    /// Returns `Layout` error on any other length.
    pub fn from_slice(scores: &[f32]) -> Result<Self> {
        let scores = scores
            .try_into()
            .map_err(|_| ToyNetError::layout("output vector", NUM_CLASSES, scores.len()))?;
        Ok(Self { scores })
    }

    /// Index of the highest score; the first one wins ties.
    pub fn argmax(&self) -> usize {
        self.scores
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
            .0
    }
}

/// Outputs of one inference batch with timing
#[derive(Debug, Clone)]
pub struct BatchOutput {
    /// One score vector per input sample, in input order
    pub outputs: Vec<OutputVector>,

    /// Wall-clock time of the whole batch
    pub elapsed: Duration,
}

impl BatchOutput {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// True if the batch carried no samples
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Mean latency per sample in microseconds
    pub fn latency_us_per_sample(&self) -> f64 {
        if self.outputs.is_empty() {
            return 0.0;
        }
        self.elapsed.as_secs_f64() * 1_000_000.0 / self.outputs.len() as f64
    }

    /// Samples per second
    pub fn samples_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.outputs.len() as f64 / secs
    }
}

/// Result of a weight load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// Weight words sent
    pub words: usize,

    /// Acknowledgment word returned by the accelerator
    pub ack: u32,

    /// Wall-clock time of the whole load
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_requires_whole_samples() {
        assert!(InputBatch::new(vec![0.0; SAMPLE_LEN * 3]).is_ok());
        assert!(InputBatch::new(vec![0.0; SAMPLE_LEN + 1]).is_err());
        assert!(InputBatch::new(Vec::new()).is_err());
    }

    #[test]
    fn batch_sample_access() {
        let mut data = vec![0.0; SAMPLE_LEN * 2];
        data[SAMPLE_LEN] = 5.0;
        let batch = InputBatch::new(data).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.sample(1).unwrap()[0], 5.0);
        assert!(batch.sample(2).is_none());
        assert_eq!(batch.samples().count(), 2);
    }

    #[test]
    fn from_samples_rejects_short_sample() {
        let good = vec![0.0; SAMPLE_LEN];
        let short = vec![0.0; 10];
        assert!(InputBatch::from_samples([good.as_slice(), short.as_slice()]).is_err());
        assert_eq!(InputBatch::from_samples([good.as_slice(), good.as_slice()]).unwrap().len(), 2);
    }

    #[test]
    fn argmax_first_wins_ties() {
        let mut scores = [0.0; NUM_CLASSES];
        scores[3] = 2.0;
        scores[7] = 2.0;
        assert_eq!(OutputVector { scores }.argmax(), 3);
        assert!(OutputVector::from_slice(&[0.0; 9]).is_err());
    }

    #[test]
    fn batch_metrics() {
        let out = BatchOutput {
            outputs: vec![OutputVector { scores: [0.0; NUM_CLASSES] }; 4],
            elapsed: Duration::from_millis(2),
        };
        assert!((out.latency_us_per_sample() - 500.0).abs() < 1e-9);
        assert!((out.samples_per_sec() - 2000.0).abs() < 1e-6);
    }
}
