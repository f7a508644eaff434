// SPDX-License-Identifier: AGPL-3.0-only

//! Output post-processing and accuracy accounting

use crate::error::{ModelError, Result};
use std::fmt;
use toynet_driver::{BatchOutput, OutputVector};
use tracing::info;

/// Samples between running-accuracy log lines
pub const DEFAULT_REPORT_INTERVAL: usize = 100;

/// Numerically stable log-softmax
pub fn log_softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = scores.iter().map(|&s| (s - max).exp()).sum::<f32>().ln();
    scores.iter().map(|&s| s - max - log_sum).collect()
}

/// Softmax probabilities
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    log_softmax(scores).into_iter().map(f32::exp).collect()
}

/// Index of the largest value; the first one wins ties. NaN entries are
/// skipped; `None` when nothing else is left.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, bv)) if v <= bv => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Predicted class of one output vector; `None` if any score is NaN
pub fn predict(output: &OutputVector) -> Option<usize> {
    argmax(&log_softmax(&output.scores))
}

/// Final or running tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccuracyReport {
    /// Correct predictions
    pub correct: usize,
    /// Samples seen
    pub total: usize,
}

impl AccuracyReport {
    /// Accuracy in percent
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.correct as f64 / self.total as f64
    }
}

impl fmt::Display for AccuracyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} ({:.0}%)", self.correct, self.total, self.percent())
    }
}

/// Counts correct predictions over a stream of outputs
#[derive(Debug, Clone)]
pub struct AccuracyEvaluator {
    report: AccuracyReport,
    interval: usize,
}

impl Default for AccuracyEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl AccuracyEvaluator {
    /// Evaluator logging every [`DEFAULT_REPORT_INTERVAL`] samples
    pub const fn new() -> Self {
        Self::with_report_interval(DEFAULT_REPORT_INTERVAL)
    }

    /// Evaluator logging every `interval` samples (0 disables logging)
    pub const fn with_report_interval(interval: usize) -> Self {
        Self {
            report: AccuracyReport { correct: 0, total: 0 },
            interval,
        }
    }

    /// Score one output against its label; returns whether it was correct.
    pub fn record(&mut self, output: &OutputVector, label: usize) -> bool {
        let index = self.report.total;
        let correct = predict(output) == Some(label);
        self.report.total += 1;
        if correct {
            self.report.correct += 1;
        }
        if self.interval != 0 && index % self.interval == 0 {
            info!("Index: {index}, correct: {}", self.report.correct);
        }
        correct
    }

    /// Score a batch; outputs and labels pair up in submission order.
    ///
    /// # Errors
    ///
    /// Returns `LabelCount` if the lengths differ.
    pub fn record_batch(&mut self, batch: &BatchOutput, labels: &[u8]) -> Result<usize> {
        if batch.outputs.len() != labels.len() {
            return Err(ModelError::LabelCount {
                outputs: batch.outputs.len(),
                labels: labels.len(),
            });
        }
        let mut correct = 0;
        for (output, &label) in batch.outputs.iter().zip(labels) {
            if self.record(output, usize::from(label)) {
                correct += 1;
            }
        }
        Ok(correct)
    }

    /// Tally so far
    pub const fn report(&self) -> AccuracyReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn one_hot(class: usize) -> OutputVector {
        let mut scores = [0.0; 10];
        scores[class] = 5.0;
        OutputVector { scores }
    }

    #[test]
    fn uniform_scores_give_uniform_softmax() {
        let probs = softmax(&[0.0; 10]);
        assert!(probs.iter().all(|p| (p - 0.1).abs() < 1e-6));
    }

    #[test]
    fn log_softmax_is_stable_for_large_scores() {
        let out = log_softmax(&[1000.0, 1000.0]);
        assert!((out[0] - (0.5f32).ln()).abs() < 1e-6);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn argmax_rules() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), Some(1));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[-1.0]), Some(0));
        assert_eq!(argmax(&[f32::NAN, 1.0, 0.5]), Some(1));
        assert_eq!(argmax(&[0.5, f32::NAN, 0.25]), Some(0));
        assert_eq!(argmax(&[f32::NAN, f32::NAN]), None);
    }

    #[test]
    fn nan_output_is_never_correct() {
        let mut scores = [0.0; 10];
        scores[4] = f32::NAN;
        let garbage = OutputVector { scores };
        assert_eq!(predict(&garbage), None);

        let mut eval = AccuracyEvaluator::with_report_interval(0);
        for label in 0..10 {
            assert!(!eval.record(&garbage, label));
        }
        assert_eq!(eval.report(), AccuracyReport { correct: 0, total: 10 });
    }

    #[test]
    fn evaluator_counts() {
        let mut eval = AccuracyEvaluator::with_report_interval(0);
        assert!(eval.record(&one_hot(3), 3));
        assert!(!eval.record(&one_hot(3), 4));
        let report = eval.report();
        assert_eq!(report, AccuracyReport { correct: 1, total: 2 });
        assert!((report.percent() - 50.0).abs() < 1e-9);
        assert_eq!(report.to_string(), "1 / 2 (50%)");
    }

    #[test]
    fn batch_pairs_in_order() {
        let batch = BatchOutput {
            outputs: vec![one_hot(0), one_hot(1), one_hot(2)],
            elapsed: Duration::ZERO,
        };
        let mut eval = AccuracyEvaluator::new();
        assert_eq!(eval.record_batch(&batch, &[0, 1, 9]).unwrap(), 2);
        assert!(matches!(
            eval.record_batch(&batch, &[0]),
            Err(ModelError::LabelCount { outputs: 3, labels: 1 })
        ));
    }
}
