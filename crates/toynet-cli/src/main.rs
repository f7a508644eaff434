// SPDX-License-Identifier: AGPL-3.0-only

//! `toynet`: command-line interface for the ToyNet accelerator.
//!
//! ```text
//! USAGE:
//!   toynet layout            Weight stream layout with offsets
//!   toynet image <path>      Validate and print an accelerator image
//!   toynet smoke <image>     All-zero weights, expect uniform softmax
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use toynet_chip::arch::{NUM_CLASSES, SAMPLE_LEN};
use toynet_driver::{Accelerator, AcceleratorImage, InferenceSession, InputBatch};
use toynet_models::{softmax, Checkpoint, WeightSerializer};
use tracing_subscriber::EnvFilter;

const SMOKE_BATCH: usize = 8;
const SMOKE_TOLERANCE: f32 = 1e-6;

#[derive(Parser)]
#[command(name = "toynet", about = "ToyNet accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the weight stream layout of the reference network.
    Layout,
    /// Validate an accelerator image manifest and print it.
    Image {
        /// Path to the TOML manifest.
        path: PathBuf,
    },
    /// Load all-zero weights and check that every output is uniform.
    Smoke {
        /// Path to the TOML manifest.
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Layout => cmd_layout(),
        Cmd::Image { path } => cmd_image(&path)?,
        Cmd::Smoke { image } => cmd_smoke(&image)?,
    }

    Ok(())
}

fn cmd_layout() {
    let serializer = WeightSerializer::reference();

    println!("{:<8} {:<14} {:>8} {:>8}", "layer", "kind", "offset", "words");
    for entry in serializer.layout() {
        println!("{:<8} {:<14} {:>8} {:>8}", entry.name, entry.kind, entry.offset, entry.len);
    }
    println!("{:<8} {:<14} {:>8} {:>8}", "total", "", "", serializer.expected_len());
}

fn cmd_image(path: &Path) -> Result<()> {
    let image = AcceleratorImage::from_file(path)?;
    let protocol = &image.protocol;

    println!("Image        : {}", image.name);
    println!("Backend      : {}", image.backend.kind);
    println!("Weight load  : code {}", protocol.weight_load_code);
    println!("Infer        : code {} ({:?} count)", protocol.infer_code, protocol.count_field);
    println!("Blob words   : {}", protocol.blob_words);
    println!("Ack          : {:?}", protocol.ack);

    if let Some(axi) = &image.axi_dma {
        println!("DMA UIO      : {}", axi.dma_uio.display());
        match &axi.control_uio {
            Some(p) => println!("Control UIO  : {}", p.display()),
            None => println!("Control UIO  : (none)"),
        }
        println!("DMA buffer   : {}", axi.buffer_device);
        if let Some(ms) = axi.poll_timeout_ms {
            println!("Poll timeout : {ms} ms");
        }
    }

    if protocol.blob_words != WeightSerializer::reference().expected_len() {
        println!();
        println!(
            "warning: blob_words {} differs from the reference network ({})",
            protocol.blob_words,
            WeightSerializer::reference().expected_len()
        );
    }

    Ok(())
}

fn cmd_smoke(image: &Path) -> Result<()> {
    let blob = WeightSerializer::reference().serialize(&Checkpoint::zeros())?;
    let mut acc = Accelerator::open_path(image)?;
    let batch_size = SMOKE_BATCH.min(acc.encoder().max_batch() as usize);
    let mut session = InferenceSession::new(&mut acc)?;

    let load = session.load_weights(&blob)?;
    println!("Ack          : {} ({} words, {:.3} ms)", load.ack, load.words, load.elapsed.as_secs_f64() * 1e3);

    let pixels: Vec<f32> = (0..batch_size * SAMPLE_LEN).map(|i| (i % 256) as f32 / 255.0).collect();
    let batch = InputBatch::new(pixels)?;

    let serial = session.infer_serial(&batch)?;
    let pipelined = session.infer_pipelined(&batch)?;
    println!("Serial       : {:.1} us/sample", serial.latency_us_per_sample());
    println!("Pipelined    : {:.1} us/sample", pipelined.latency_us_per_sample());

    let uniform = 1.0 / NUM_CLASSES as f32;
    let mut failures = 0;
    for (index, output) in serial.outputs.iter().chain(&pipelined.outputs).enumerate() {
        let probs = softmax(&output.scores);
        if probs.iter().any(|p| (p - uniform).abs() > SMOKE_TOLERANCE) {
            println!("Output {index}: not uniform: {probs:?}");
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} of {} outputs were not uniform", serial.len() + pipelined.len());
    }
    println!("Smoke test passed: {} outputs uniform at {uniform}", serial.len() + pipelined.len());
    Ok(())
}
