// SPDX-License-Identifier: AGPL-3.0-only

//! Opened accelerator handle
//!
//! An [`Accelerator`] bundles what one configured accelerator image provides:
//! a send channel, a receive channel, an optional control interface, and the
//! buffer arena its engines can reach. Opening starts the kernel and enables
//! auto-restart when the image has a control interface.

use crate::backends::{open_backend, BackendParts};
use crate::buffer::{DmaAllocator, DmaPool, SlotId};
use crate::channel::TransferChannel;
use crate::command::CommandEncoder;
use crate::control::AcceleratorControl;
use crate::error::Result;
use crate::image::AcceleratorImage;
use std::path::Path;
use tracing::{debug, info, warn};

/// Handle to one configured accelerator
#[derive(Debug)]
pub struct Accelerator {
    image: AcceleratorImage,
    encoder: CommandEncoder,
    send: TransferChannel,
    recv: TransferChannel,
    control: Option<Box<dyn AcceleratorControl>>,
    allocator: Box<dyn DmaAllocator>,
    pool: DmaPool,
}

impl Accelerator {
    /// Open the backend named by `image` and start its kernel.
    ///
    /// # Errors
    ///
    /// Returns `Load` error if the backend cannot be opened or started.
    pub fn open(image: AcceleratorImage) -> Result<Self> {
        let parts = open_backend(&image)?;
        Self::from_parts(image, parts)
    }

    /// Read a manifest from `path` and open it.
    ///
    /// # Errors
    ///
    /// Returns `Load` error if the manifest is invalid or the backend
    /// cannot be opened.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(AcceleratorImage::from_file(path)?)
    }

    /// Assemble from already opened backend parts.
    ///
    /// # Errors
    ///
    /// Returns error if the image's command layout is invalid or the kernel
    /// refuses to start.
    pub fn from_parts(image: AcceleratorImage, parts: BackendParts) -> Result<Self> {
        let encoder = CommandEncoder::new(image.protocol.command_layout())?;
        let BackendParts {
            send,
            recv,
            mut control,
            allocator,
        } = parts;

        if let Some(control) = control.as_mut() {
            control.start()?;
            control.enable_auto_restart()?;
            debug!("{}: kernel started with auto-restart", image.name);
        }

        info!(
            "Opened accelerator image {:?} ({} backend{})",
            image.name,
            image.backend.kind,
            if control.is_some() { "" } else { ", no control interface" }
        );

        Ok(Self {
            image,
            encoder,
            send: TransferChannel::new(send),
            recv: TransferChannel::new(recv),
            control,
            allocator,
            pool: DmaPool::new(),
        })
    }

    /// Manifest this handle was opened from
    pub const fn image(&self) -> &AcceleratorImage {
        &self.image
    }

    /// Command encoder for the image's layout
    pub const fn encoder(&self) -> &CommandEncoder {
        &self.encoder
    }

    /// True if the image exposes a kernel control interface
    pub fn has_control(&self) -> bool {
        self.control.is_some()
    }

    /// Allocate a DMA-capable buffer of `words` words.
    ///
    /// # Errors
    ///
    /// Returns error if the backend's memory is exhausted.
    pub fn allocate(&mut self, words: usize) -> Result<SlotId> {
        let region = self.allocator.allocate(words)?;
        Ok(self.pool.insert(region))
    }

    /// Return a buffer to the allocator.
    ///
    /// # Errors
    ///
    /// Returns `BufferInFlight` if a transfer still references it.
    pub fn release(&mut self, slot: SlotId) -> Result<()> {
        self.pool.release(slot).map(drop)
    }

    /// Buffer arena
    pub const fn pool(&self) -> &DmaPool {
        &self.pool
    }

    /// Mutable buffer arena
    pub fn pool_mut(&mut self) -> &mut DmaPool {
        &mut self.pool
    }

    /// Send channel
    pub const fn send_channel(&self) -> &TransferChannel {
        &self.send
    }

    /// Receive channel
    pub const fn recv_channel(&self) -> &TransferChannel {
        &self.recv
    }

    /// Enqueue a send of the first `words` words of `slot`.
    ///
    /// # Errors
    ///
    /// See [`TransferChannel::transfer_words`].
    pub fn send(&mut self, slot: SlotId, words: usize) -> Result<()> {
        self.send.transfer_words(&mut self.pool, slot, words)
    }

    /// Enqueue a receive into the first `words` words of `slot`.
    ///
    /// # Errors
    ///
    /// See [`TransferChannel::transfer_words`].
    pub fn recv(&mut self, slot: SlotId, words: usize) -> Result<()> {
        self.recv.transfer_words(&mut self.pool, slot, words)
    }

    /// Wait for every outstanding send.
    ///
    /// # Errors
    ///
    /// See [`TransferChannel::wait`].
    pub fn wait_send(&mut self) -> Result<()> {
        self.send.wait(&mut self.pool)
    }

    /// Wait for every outstanding receive.
    ///
    /// # Errors
    ///
    /// See [`TransferChannel::wait`].
    pub fn wait_recv(&mut self) -> Result<()> {
        self.recv.wait(&mut self.pool)
    }

    /// Abandon outstanding transfers on both channels.
    ///
    /// # Errors
    ///
    /// Returns the first engine reset failure.
    pub fn abort(&mut self) -> Result<()> {
        let send = self.send.abort(&mut self.pool);
        let recv = self.recv.abort(&mut self.pool);
        send.and(recv)
    }
}

impl Drop for Accelerator {
    fn drop(&mut self) {
        if !self.send.is_idle() || !self.recv.is_idle() {
            warn!("{}: closing with transfers outstanding", self.image.name);
            if let Err(e) = self.abort() {
                warn!("{}: abort on close failed: {e}", self.image.name);
            }
        }
        debug!(
            "Closed accelerator {:?}: {} sends, {} receives",
            self.image.name,
            self.send.completed(),
            self.recv.completed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{VirtualAccelerator, VirtualKind};
    use crate::error::ToyNetError;

    #[test]
    fn open_starts_kernel() {
        let image = AcceleratorImage::software("unit");
        let virt = VirtualAccelerator::new(VirtualKind::ToyNet, &image.protocol);
        let monitor = virt.monitor();
        let acc = Accelerator::from_parts(image, virt.into_parts()).unwrap();
        assert!(acc.has_control());
        assert!(monitor.is_started());
        assert!(monitor.auto_restart());
    }

    #[test]
    fn loopback_has_no_control() {
        let acc = Accelerator::open(AcceleratorImage::loopback("echo")).unwrap();
        assert!(!acc.has_control());
    }

    #[test]
    fn release_in_flight_rejected() {
        let mut acc = Accelerator::open(AcceleratorImage::loopback("echo")).unwrap();
        let slot = acc.allocate(8).unwrap();
        acc.send(slot, 8).unwrap();
        let err = acc.release(slot).unwrap_err();
        assert!(matches!(err, ToyNetError::BufferInFlight { .. }));
        acc.wait_send().unwrap();
        acc.release(slot).unwrap();
    }
}
