// SPDX-License-Identifier: AGPL-3.0-only

//! Batched inference latency (Protocol C).
//!
//! One command announces the whole batch; the input stream is left in
//! flight while the outputs are drained one by one.
//!
//! Usage:
//!   toynet_pipelined toynet-opt3.toml
//!   toynet_pipelined toynet-opt3.toml --batch 1000

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use toynet_driver::{InferenceSession, InputBatch};

#[derive(Parser)]
#[command(name = "toynet_pipelined", about = "Measure pipelined inference latency", version)]
struct Args {
    /// Accelerator image manifest
    image: PathBuf,

    /// Samples announced by the single command
    #[arg(long, default_value_t = toynet_bench::DEFAULT_SAMPLES)]
    batch: usize,

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

    let batch = InputBatch::new(toynet_bench::random_samples(&mut rand::rng(), args.batch))?;
    let out = session.infer_pipelined(&batch)?;

    let elapsed_ms = out.elapsed.as_secs_f64() * 1e3;
    println!("Elapsed time: {elapsed_ms:.3} ms");
    println!("Average inference time: {:.3} us", out.latency_us_per_sample());
    println!("Throughput: {:.1} samples/s", out.samples_per_sec());
    Ok(())
}
