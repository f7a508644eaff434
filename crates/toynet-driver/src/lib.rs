// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side transfer protocol for the ToyNet DMA inference accelerator.
//!
//! The accelerator is a streaming kernel behind one send and one receive DMA
//! channel. Every request is a command word followed by a payload; the
//! accelerator answers on the receive channel.
//!
//! # Layers
//!
//! ```text
//! InferenceSession   weight-load handshake, Protocol B (serial),
//!                    Protocol C (pipelined)
//! probe_throughput   Protocol A (raw bandwidth, loopback image)
//! Accelerator        opened image: two TransferChannels + control + DmaPool
//! backends           software ToyNet, software loopback, AXI DMA (UIO)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use toynet_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let mut acc = Accelerator::open_path("toynet.toml")?;
//! let mut session = InferenceSession::new(&mut acc)?;
//!
//! let blob = WeightBlob::reference(vec![0.0; 61_750])?;
//! session.load_weights(&blob)?;
//!
//! let batch = InputBatch::new(vec![0.0; 784 * 8])?;
//! let out = session.infer_pipelined(&batch)?;
//! println!("{:.1} us/sample", out.latency_us_per_sample());
//! # Ok(())
//! # }
//! ```
//!
//! A buffer handed to a channel cannot be read, written, resubmitted, or
//! released until the `wait()` that retires it returns. The [`DmaPool`]
//! enforces this at runtime.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

mod accelerator;
pub mod backends;
mod blob;
mod buffer;
mod channel;
mod command;
mod control;
mod error;
mod image;
mod inference;
pub mod mmio;
mod probe;
mod session;

pub use accelerator::Accelerator;
pub use backends::{
    open_backend, BackendParts, DeviceMonitor, DeviceStats, TransferEvent, TransferStage, VirtualAccelerator, VirtualKind,
};
pub use blob::WeightBlob;
pub use buffer::{DmaAllocator, DmaPool, DmaRegion, HeapAllocator, MappedArena, SlotId};
pub use channel::{Direction, DmaEngine, TransferChannel};
pub use command::{Command, CommandEncoder, CommandLayout, CommandWord, CountField};
pub use control::AcceleratorControl;
pub use error::{Result, ToyNetError};
pub use image::{AckPolicy, AcceleratorImage, AxiDmaConfig, BackendKind, BackendSection, ProtocolConfig};
pub use inference::{BatchOutput, InputBatch, LoadReport, OutputVector};
pub use probe::{probe_throughput, ProbeOutcome, ThroughputReport};
pub use session::{InferenceSession, SessionState};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        probe_throughput, Accelerator, AcceleratorImage, BatchOutput, Command, CommandEncoder, InferenceSession,
        InputBatch, LoadReport, OutputVector, Result, SessionState, ThroughputReport, ToyNetError, WeightBlob,
    };
}
