// SPDX-License-Identifier: AGPL-3.0-only

//! Per-sample inference latency (Protocol B).
//!
//! Every sample is sent as its own command and awaited before the next one
//! is submitted, so the figure includes the full round trip.
//!
//! Usage:
//!   toynet_serial toynet-naive.toml
//!   toynet_serial toynet-naive.toml --samples 500 --checkpoint toynet.json

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use toynet_driver::{InferenceSession, InputBatch};

#[derive(Parser)]
#[command(name = "toynet_serial", about = "Measure serial inference latency", version)]
struct Args {
    /// Accelerator image manifest
    image: PathBuf,

    /// Random samples to run
    #[arg(long, default_value_t = toynet_bench::DEFAULT_SAMPLES)]
    samples: usize,

    /// Trained parameters (all zeros when omitted)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

fn main() -> Result<()> {
    toynet_bench::init_tracing();
    let args: Args = toynet_bench::parse_args();

    let blob = toynet_bench::load_blob(args.checkpoint.as_deref())?;
    let mut acc = toynet_bench::open_image(&args.image)?;
    let mut session = InferenceSession::new(&mut acc)?;
    toynet_bench::initialize_weights(&mut session, &blob)?;

    let batch = InputBatch::new(toynet_bench::random_samples(&mut rand::rng(), args.samples))?;
    let out = session.infer_serial(&batch)?;

    let elapsed_ms = out.elapsed.as_secs_f64() * 1e3;
    println!("Elapsed time: {elapsed_ms:.3} ms");
    println!("Average inference time: {:.3} ms", out.latency_us_per_sample() / 1e3);
    Ok(())
}
