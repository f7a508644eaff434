// SPDX-License-Identifier: AGPL-3.0-only

//! Accelerator backends
//!
//! - **Software**: in-process ToyNet kernel (f32 reference network)
//! - **Loopback**: in-process echo of the empty overlay, word + 13
//! - **AXI DMA**: UIO register windows and u-dma-buf memory on the board
//!
//! Every backend hands the same four parts to [`crate::Accelerator`]: a send
//! engine, a receive engine, an optional control interface, and an allocator
//! for the memory its engines can reach.

pub mod axi_dma;
mod reference_net;
pub mod software;

pub use software::{DeviceMonitor, DeviceStats, TransferEvent, TransferStage, VirtualAccelerator, VirtualKind};

use crate::buffer::DmaAllocator;
use crate::channel::DmaEngine;
use crate::control::AcceleratorControl;
use crate::error::{Result, ToyNetError};
use crate::image::{AcceleratorImage, BackendKind};

/// Parts of an opened backend
#[derive(Debug)]
pub struct BackendParts {
    /// Host-to-accelerator engine
    pub send: Box<dyn DmaEngine>,
    /// Accelerator-to-host engine
    pub recv: Box<dyn DmaEngine>,
    /// Kernel control, absent for `ap_ctrl_none` images
    pub control: Option<Box<dyn AcceleratorControl>>,
    /// Memory the engines can address
    pub allocator: Box<dyn DmaAllocator>,
}

/// Open the backend named by `image`.
///
/// # Errors
///
/// Returns error if the backend's devices cannot be opened.
pub fn open_backend(image: &AcceleratorImage) -> Result<BackendParts> {
    match image.backend.kind {
        BackendKind::Software => Ok(VirtualAccelerator::new(VirtualKind::ToyNet, &image.protocol).into_parts()),
        BackendKind::Loopback => Ok(VirtualAccelerator::new(VirtualKind::Loopback, &image.protocol).into_parts()),
        BackendKind::AxiDma => {
            let config = image.axi_dma.as_ref().ok_or_else(|| {
                ToyNetError::load(format!("image {:?}: missing [axi_dma] table", image.name))
            })?;
            axi_dma::open(config)
        }
    }
}
