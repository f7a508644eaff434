// SPDX-License-Identifier: AGPL-3.0-only

#![deny(unsafe_code)]

//! ToyNet parameters, data and evaluation
//!
//! This crate turns trained parameters into the accelerator's weight stream
//! and scores what comes back.
//!
//! - [`Checkpoint`]: layer name → tensors, stored as JSON
//! - [`WeightSerializer`]: checkpoint → [`toynet_driver::WeightBlob`] in
//!   stream order, batch norm folded
//! - [`Dataset`]: MNIST test set (IDX) with fixed normalization
//! - [`AccuracyEvaluator`]: log-softmax + argmax accounting
//!
//! # Example
//!
//! ```no_run
//! use toynet_models::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let checkpoint = Checkpoint::from_file("toynet.json")?;
//! let blob = WeightSerializer::reference().serialize(&checkpoint)?;
//! assert_eq!(blob.len(), 61_750);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

mod accuracy;
mod checkpoint;
mod dataset;
mod error;
mod serializer;
mod tensor;

pub use accuracy::{argmax, log_softmax, predict, softmax, AccuracyEvaluator, AccuracyReport, DEFAULT_REPORT_INTERVAL};
pub use checkpoint::{Checkpoint, LayerParams, DEFAULT_BN_EPS};
pub use dataset::{normalize, Dataset, MNIST_MEAN, MNIST_STD, TEST_IMAGES, TEST_LABELS};
pub use error::{ModelError, Result};
pub use serializer::{fold_batch_norm, FoldedBatchNorm, LayerOffset, WeightSerializer};
pub use tensor::{numel, Tensor};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{AccuracyEvaluator, AccuracyReport, Checkpoint, Dataset, ModelError, Result, Tensor, WeightSerializer};
}
