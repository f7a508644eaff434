// SPDX-License-Identifier: AGPL-3.0-only

//! Test-set accuracy of a trained checkpoint on the accelerator.
//!
//! Loads the checkpoint into the accelerator, then classifies the MNIST test
//! set. Samples go one at a time (Protocol B) unless `--batch` selects the
//! pipelined protocol.
//!
//! Usage:
//!   toynet_accuracy toynet.json toynet-naive.toml
//!   toynet_accuracy toynet.json toynet-opt3.toml --batch 100 --data-dir ./data

use anyhow::{ensure, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use toynet_driver::{BatchOutput, InferenceSession, InputBatch};
use toynet_models::{AccuracyEvaluator, Dataset, DEFAULT_REPORT_INTERVAL};

#[derive(Parser)]
#[command(name = "toynet_accuracy", about = "Evaluate test-set accuracy on the accelerator", version)]
struct Args {
    /// Trained parameters (JSON checkpoint)
    checkpoint: PathBuf,

    /// Accelerator image manifest
    image: PathBuf,

    /// Directory holding the IDX test files
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Pipelined batches of this many samples
    #[arg(long)]
    batch: Option<usize>,

    /// Evaluate only the first N samples
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> Result<()> {
    toynet_bench::init_tracing();
    let args: Args = toynet_bench::parse_args();
    if let Some(n) = args.batch {
        ensure!(n > 0, "--batch must be at least 1");
    }

    let blob = toynet_bench::load_blob(Some(&args.checkpoint))?;
    let mut acc = toynet_bench::open_image(&args.image)?;
    let mut session = InferenceSession::new(&mut acc)?;
    toynet_bench::initialize_weights(&mut session, &blob)?;
    println!("Weight initialization successful");

    let mut dataset = Dataset::open_dir(&args.data_dir)?;
    if let Some(n) = args.limit {
        dataset = dataset.truncate(n);
    }
    println!("Test dataset is successfully loaded");

    let mut evaluator = AccuracyEvaluator::with_report_interval(0);
    let mut busy = Duration::ZERO;
    let batch_size = args.batch.unwrap_or(1);
    let samples: Vec<(Vec<f32>, u8)> = dataset.iter().collect();

    for chunk in samples.chunks(batch_size) {
        let input = InputBatch::from_samples(chunk.iter().map(|(px, _)| px.as_slice()))?;
        let out: BatchOutput = if args.batch.is_some() {
            session.infer_pipelined(&input)?
        } else {
            session.infer_serial(&input)?
        };
        busy += out.elapsed;

        for (output, (_, label)) in out.outputs.iter().zip(chunk) {
            let index = evaluator.report().total;
            evaluator.record(output, usize::from(*label));
            if index % DEFAULT_REPORT_INTERVAL == 0 {
                println!("Index: {index}, correct: {}", evaluator.report().correct);
            }
        }
    }

    let report = evaluator.report();
    println!("Test accuracy: {report}");
    if report.total > 0 {
        println!(
            "Average inference time: {:.3} us",
            busy.as_secs_f64() * 1e6 / report.total as f64
        );
    }
    Ok(())
}
