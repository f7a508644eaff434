// SPDX-License-Identifier: AGPL-3.0-only

//! Raw channel throughput (Protocol A).
//!
//! Streams one buffer out and an equally sized buffer back through a
//! loopback image, awaiting only the receive. The loopback overlay returns
//! every word plus 13, which is checked after the run.
//!
//! Usage:
//!   data_transfer loopback.toml
//!   data_transfer loopback.toml --words 65536

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use toynet_chip::wire::{PROBE_WORDS, WORD_BYTES};
use toynet_driver::probe_throughput;

const SHOWN: usize = 10;

#[derive(Parser)]
#[command(name = "data_transfer", about = "Measure raw DMA throughput", version)]
struct Args {
    /// Accelerator image manifest (loopback build)
    image: PathBuf,

    /// Words per direction
    #[arg(long, default_value_t = PROBE_WORDS)]
    words: usize,
}

fn main() -> Result<()> {
    toynet_bench::init_tracing();
    let args: Args = toynet_bench::parse_args();

    let mut acc = toynet_bench::open_image(&args.image)?;

    let bytes = args.words * WORD_BYTES;
    println!("Buffer size: {} KiB", bytes as f64 / 1024.0);
    println!("Buffer size: {} MiB", bytes as f64 / 1024.0 / 1024.0);

    let mut rng = rand::rng();
    let data: Vec<u32> = (0..args.words).map(|_| rng.random_range(0..100)).collect();

    println!("Before: ");
    print_ends(&data, &[0; SHOWN][..data.len().min(SHOWN)]);

    let outcome = probe_throughput(&mut acc, data)?;

    println!("Elapsed time: {:.3} ms", outcome.report.elapsed_ms());
    println!("Throughput: {} Mbps", outcome.report.mbps());

    println!("After: ");
    print_ends(&outcome.sent, &outcome.received);

    let mismatches = outcome.loopback_mismatches();
    if mismatches > 0 {
        println!("Loopback mismatches: {mismatches} / {}", outcome.sent.len());
    }
    Ok(())
}

fn print_ends(sent: &[u32], received: &[u32]) {
    println!("{:?}", head(sent));
    println!("{:?}", head(received));
    println!("{:?}", tail(sent));
    println!("{:?}", tail(received));
}

fn head(words: &[u32]) -> &[u32] {
    &words[..words.len().min(SHOWN)]
}

fn tail(words: &[u32]) -> &[u32] {
    &words[words.len().saturating_sub(SHOWN)..]
}
