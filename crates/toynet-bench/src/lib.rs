// SPDX-License-Identifier: AGPL-3.0-only

//! Shared plumbing for the ToyNet measurement programs.
//!
//! ```text
//! data_transfer     <image>               Protocol A, loopback image
//! toynet_serial     <image>               Protocol B, 100 random samples
//! toynet_pipelined  <image>               Protocol C, one batch of 100
//! toynet_accuracy   <checkpoint> <image>  test-set accuracy
//! ```
//!
//! Every program exits with status 1 and a message on stderr when the
//! arguments are wrong or the image cannot be opened.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate)]

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use std::path::Path;
use toynet_chip::arch::SAMPLE_LEN;
use toynet_driver::{Accelerator, InferenceSession, LoadReport, WeightBlob};
use toynet_models::{Checkpoint, WeightSerializer};
use tracing_subscriber::EnvFilter;

/// Samples used by the latency programs
pub const DEFAULT_SAMPLES: usize = 100;

/// Install the `RUST_LOG` subscriber, `warn` when unset.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Parse the command line; a malformed invocation exits with status 1.
///
/// `--help` and `--version` keep clap's usual behaviour.
pub fn parse_args<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    }
}

/// Open the accelerator image at `path`.
///
/// # Errors
///
/// Returns error if the manifest is invalid or the backend cannot be opened.
pub fn open_image(path: &Path) -> Result<Accelerator> {
    Accelerator::open_path(path).with_context(|| format!("Failed to load the accelerator image: {}", path.display()))
}

/// Weight blob from `checkpoint`, or all zeros when none is given.
///
/// # Errors
///
/// Returns error if the checkpoint cannot be read or does not fit the
/// reference architecture.
pub fn load_blob(checkpoint: Option<&Path>) -> Result<WeightBlob> {
    let serializer = WeightSerializer::reference();
    let checkpoint = match checkpoint {
        Some(path) => {
            Checkpoint::from_file(path).with_context(|| format!("Failed to load checkpoint {}", path.display()))?
        }
        None => Checkpoint::zeros(),
    };
    Ok(serializer.serialize(&checkpoint)?)
}

/// Run the weight-load handshake and print the acknowledgement.
///
/// # Errors
///
/// Returns error if the handshake fails.
pub fn initialize_weights(session: &mut InferenceSession<'_>, blob: &WeightBlob) -> Result<LoadReport> {
    let report = session.load_weights(blob).context("Weight initialization failed")?;
    println!("Ack: {}", report.ack);
    Ok(report)
}

/// `count` samples of uniform [0, 1) pixels, concatenated.
pub fn random_samples(rng: &mut impl Rng, count: usize) -> Vec<f32> {
    (0..count * SAMPLE_LEN).map(|_| rng.random::<f32>()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn random_samples_are_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        let data = random_samples(&mut rng, 3);
        assert_eq!(data.len(), 3 * 784);
        assert!(data.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn zero_blob_without_checkpoint() {
        let blob = load_blob(None).unwrap();
        assert_eq!(blob.len(), 61_750);
        assert!(blob.as_slice().iter().all(|&w| w == 0.0));
    }

    #[test]
    fn checkpoint_file_is_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toynet.json");
        Checkpoint::zeros().save(&path).unwrap();
        assert_eq!(load_blob(Some(&path)).unwrap().len(), 61_750);
    }

    #[test]
    fn missing_checkpoint_is_error() {
        assert!(load_blob(Some(Path::new("/nonexistent/toynet.json"))).is_err());
    }

    #[test]
    fn missing_image_is_error() {
        let err = open_image(Path::new("/nonexistent/toynet.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to load the accelerator image"));
    }
}
