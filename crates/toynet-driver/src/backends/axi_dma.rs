// SPDX-License-Identifier: AGPL-3.0-only

//! AXI DMA backend over UIO and u-dma-buf
//!
//! ```text
//! /dev/uioN          AXI DMA registers (simple mode, one MM2S + one S2MM)
//! /dev/uioM          HLS kernel ap_ctrl (absent for ap_ctrl_none images)
//! /dev/udmabufK      physically contiguous, uncached buffer memory
//! ```
//!
//! Simple-mode AXI DMA runs one transfer per direction at a time, so each
//! engine reports `max_outstanding() == 1`. Completion is detected by
//! polling the IDLE bit of the status register; the caller's thread yields
//! between polls and an optional wall-clock bound turns a stuck channel into
//! [`ToyNetError::Timeout`].

use super::BackendParts;
use crate::buffer::{DmaAllocator, DmaRegion, MappedArena};
use crate::channel::{Direction, DmaEngine};
use crate::control::AcceleratorControl;
use crate::error::{Result, ToyNetError};
use crate::image::AxiDmaConfig;
use crate::mmio::{read_sysfs_number, MappedRegion};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use toynet_chip::regs::{ap_ctrl, axi_dma};
use toynet_chip::wire::WORD_BYTES;
use tracing::{debug, info, warn};

/// Buffer placement granularity inside the u-dma-buf area
const BUFFER_ALIGN: usize = 64;

/// Polls before a soft reset is declared stuck
const RESET_SPINS: usize = 10_000;

/// Open every part of the AXI DMA backend described by `config`.
///
/// # Errors
///
/// Returns error if a device node is missing or cannot be mapped.
pub fn open(config: &AxiDmaConfig) -> Result<BackendParts> {
    let dma_size = uio_map_size(&config.dma_uio).unwrap_or(axi_dma::REGION_SIZE);
    let regs = Arc::new(MappedRegion::map(&config.dma_uio, dma_size, 0, false)?);
    let timeout = config.poll_timeout_ms.map(Duration::from_millis);

    let mut send = AxiDmaEngine::new(Arc::clone(&regs), Direction::Send, timeout);
    let mut recv = AxiDmaEngine::new(regs, Direction::Receive, timeout);
    send.reset()?;
    recv.reset()?;

    let control: Option<Box<dyn AcceleratorControl>> = match &config.control_uio {
        Some(path) => Some(Box::new(HlsControl::open(path)?)),
        None => None,
    };
    let allocator = UdmaBufAllocator::open(&config.buffer_device)?;

    info!(
        "AXI DMA backend: {} (control: {})",
        config.dma_uio.display(),
        config
            .control_uio
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.display().to_string())
    );

    Ok(BackendParts {
        send: Box::new(send),
        recv: Box::new(recv),
        control,
        allocator: Box::new(allocator),
    })
}

/// Size of map0 of a UIO node, from `/sys/class/uio/<node>/maps/map0/size`
fn uio_map_size(node: &Path) -> Option<usize> {
    let name = node.file_name()?;
    let attr = PathBuf::from("/sys/class/uio").join(name).join("maps/map0/size");
    read_sysfs_number(&attr).ok().and_then(|n| usize::try_from(n).ok())
}

/// Register offsets of one channel
#[derive(Debug, Clone, Copy)]
struct ChannelRegs {
    control: usize,
    status: usize,
    addr: usize,
    addr_msb: usize,
    length: usize,
}

impl ChannelRegs {
    const fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Send => Self {
                control: axi_dma::MM2S_DMACR,
                status: axi_dma::MM2S_DMASR,
                addr: axi_dma::MM2S_SA,
                addr_msb: axi_dma::MM2S_SA_MSB,
                length: axi_dma::MM2S_LENGTH,
            },
            Direction::Receive => Self {
                control: axi_dma::S2MM_DMACR,
                status: axi_dma::S2MM_DMASR,
                addr: axi_dma::S2MM_DA,
                addr_msb: axi_dma::S2MM_DA_MSB,
                length: axi_dma::S2MM_LENGTH,
            },
        }
    }
}

/// One direction of a simple-mode AXI DMA
#[derive(Debug)]
pub struct AxiDmaEngine {
    regs: Arc<MappedRegion>,
    offsets: ChannelRegs,
    direction: Direction,
    timeout: Option<Duration>,
}

impl AxiDmaEngine {
    /// Engine for `direction` over an already mapped register window
    pub fn new(regs: Arc<MappedRegion>, direction: Direction, timeout: Option<Duration>) -> Self {
        Self {
            regs,
            offsets: ChannelRegs::for_direction(direction),
            direction,
            timeout,
        }
    }

    fn status(&self) -> u32 {
        self.regs.read32(self.offsets.status)
    }

    fn check_status(&self, status: u32) -> Result<()> {
        if status & axi_dma::status::ERROR_MASK != 0 {
            return Err(ToyNetError::hardware_error(format!(
                "{} DMA status {status:#010x}",
                self.direction
            )));
        }
        Ok(())
    }
}

impl DmaEngine for AxiDmaEngine {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn max_outstanding(&self) -> usize {
        1
    }

    fn start(&mut self, region: &mut DmaRegion, words: usize) -> Result<()> {
        let addr = region.device_addr().ok_or_else(|| {
            ToyNetError::invalid_state("AXI DMA needs a physically contiguous buffer, got heap memory")
        })?;
        let bytes = words * WORD_BYTES;
        if bytes > axi_dma::MAX_TRANSFER_BYTES {
            return Err(ToyNetError::invalid_state(format!(
                "{bytes}-byte transfer exceeds the {}-byte length register",
                axi_dma::MAX_TRANSFER_BYTES
            )));
        }

        let status = self.status();
        self.check_status(status)?;
        if status & axi_dma::status::HALTED != 0 {
            self.regs.write32(self.offsets.control, axi_dma::control::RUN);
        }

        // Clear stale completion interrupts (write-1-to-clear)
        self.regs
            .write32(self.offsets.status, axi_dma::status::IOC_IRQ | axi_dma::status::ERR_IRQ);

        #[allow(clippy::cast_possible_truncation)]
        {
            self.regs.write32(self.offsets.addr, addr as u32);
            self.regs.write32(self.offsets.addr_msb, (addr >> 32) as u32);
            // Writing the length starts the transfer
            self.regs.write32(self.offsets.length, bytes as u32);
        }
        debug!("{}: {bytes} bytes at {addr:#x}", self.direction);
        Ok(())
    }

    fn complete(&mut self, _region: &mut DmaRegion, _words: usize) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.status();
            self.check_status(status)?;
            if status & axi_dma::status::IDLE != 0 {
                return Ok(());
            }
            if let Some(limit) = self.timeout {
                if start.elapsed() >= limit {
                    warn!("{} DMA still busy after {limit:?} (status {status:#010x})", self.direction);
                    return Err(ToyNetError::Timeout {
                        duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            std::thread::yield_now();
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.regs.write32(self.offsets.control, axi_dma::control::RESET);
        let cleared = (0..RESET_SPINS)
            .any(|_| self.regs.read32(self.offsets.control) & axi_dma::control::RESET == 0);
        if !cleared {
            return Err(ToyNetError::hardware_error(format!("{} DMA reset did not complete", self.direction)));
        }
        self.regs.write32(self.offsets.control, axi_dma::control::RUN);
        debug!("{}: DMA channel reset", self.direction);
        Ok(())
    }
}

/// HLS `ap_ctrl` register block
#[derive(Debug)]
pub struct HlsControl {
    regs: MappedRegion,
}

impl HlsControl {
    /// Map the kernel's control window from a UIO node.
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be mapped.
    pub fn open(node: &Path) -> Result<Self> {
        let size = uio_map_size(node).unwrap_or(ap_ctrl::REGION_SIZE);
        Ok(Self::from_region(MappedRegion::map(node, size, 0, false)?))
    }

    /// Wrap an already mapped control window
    pub const fn from_region(regs: MappedRegion) -> Self {
        Self { regs }
    }
}

impl AcceleratorControl for HlsControl {
    fn start(&mut self) -> Result<()> {
        self.regs.write32(ap_ctrl::CTRL, ap_ctrl::AP_START);
        debug!("ap_ctrl: start");
        Ok(())
    }

    fn enable_auto_restart(&mut self) -> Result<()> {
        self.regs
            .write32(ap_ctrl::CTRL, ap_ctrl::AP_START | ap_ctrl::AUTO_RESTART);
        debug!("ap_ctrl: auto-restart");
        Ok(())
    }
}

/// Allocator over a u-dma-buf area
///
/// Regions are leased from a [`MappedArena`]; dropping a region hands its
/// range back, whatever else is still alive.
#[derive(Debug)]
pub struct UdmaBufAllocator {
    arena: Arc<MappedArena>,
}

impl UdmaBufAllocator {
    /// Open `/dev/<name>` using the size and physical address that the
    /// u-dma-buf driver publishes under `/sys/class/u-dma-buf/<name>/`.
    ///
    /// # Errors
    ///
    /// Returns error if the device or its sysfs attributes are missing.
    pub fn open(name: &str) -> Result<Self> {
        let sysfs = PathBuf::from("/sys/class/u-dma-buf").join(name);
        let size = usize::try_from(read_sysfs_number(&sysfs.join("size"))?)
            .map_err(|_| ToyNetError::load(format!("{name}: buffer size does not fit in memory")))?;
        let phys_base = read_sysfs_number(&sysfs.join("phys_addr"))?;
        let map = MappedRegion::map(&PathBuf::from("/dev").join(name), size, 0, true)?;
        info!("u-dma-buf {name}: {size:#x} bytes at phys {phys_base:#x}");
        Ok(Self::from_region(map, phys_base))
    }

    /// Allocate out of an already mapped area whose bus address is `phys_base`
    pub fn from_region(map: MappedRegion, phys_base: u64) -> Self {
        Self {
            arena: MappedArena::new(map, phys_base, BUFFER_ALIGN),
        }
    }

    /// Bytes held by live regions
    pub fn in_use(&self) -> usize {
        self.arena.leased_bytes()
    }
}

impl DmaAllocator for UdmaBufAllocator {
    fn allocate(&mut self, words: usize) -> Result<DmaRegion> {
        let region = self.arena.lease(words)?;
        debug!(
            "{}: {words} words leased, {} of {} bytes in use",
            self.arena.label(),
            self.arena.leased_bytes(),
            self.arena.size()
        );
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axi_dma::status;

    fn scratch(size: u64) -> (tempfile::NamedTempFile, MappedRegion) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(size).unwrap();
        let map = MappedRegion::map(file.path(), size as usize, 0, false).unwrap();
        (file, map)
    }

    #[test]
    fn allocator_places_aligned_regions() {
        let (_file, map) = scratch(4096);
        let mut alloc = UdmaBufAllocator::from_region(map, 0x1000_0000);
        let a = alloc.allocate(3).unwrap();
        let b = alloc.allocate(5).unwrap();
        assert_eq!(a.device_addr(), Some(0x1000_0000));
        assert_eq!(b.device_addr(), Some(0x1000_0000 + BUFFER_ALIGN as u64));
        assert!(alloc.allocate(4096).is_err());
    }

    #[test]
    fn allocator_rewinds_when_regions_dropped() {
        let (_file, map) = scratch(4096);
        let mut alloc = UdmaBufAllocator::from_region(map, 0);
        drop(alloc.allocate(512).unwrap());
        let again = alloc.allocate(512).unwrap();
        assert_eq!(again.device_addr(), Some(0));
    }

    #[test]
    fn scratch_reused_while_session_buffers_live() {
        let (_file, map) = scratch(1 << 20);
        let mut alloc = UdmaBufAllocator::from_region(map, 0);
        let fixed: Vec<DmaRegion> = [2, 1, 784, 10].iter().map(|&w| alloc.allocate(w).unwrap()).collect();
        let pinned = alloc.in_use();

        for _ in 0..50 {
            let batch = alloc.allocate(100 * 784).unwrap();
            assert_eq!(batch.len(), 100 * 784);
            drop(batch);
            let weights = alloc.allocate(61_750).unwrap();
            drop(weights);
            assert_eq!(alloc.in_use(), pinned);
        }
        drop(fixed);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn freed_gap_is_refilled_first() {
        let (_file, map) = scratch(4096);
        let mut alloc = UdmaBufAllocator::from_region(map, 0);
        let a = alloc.allocate(16).unwrap();
        let b = alloc.allocate(16).unwrap();
        let c = alloc.allocate(16).unwrap();
        assert_eq!(b.device_addr(), Some(64));
        drop(b);
        let d = alloc.allocate(8).unwrap();
        assert_eq!(d.device_addr(), Some(64));
        drop((a, c, d));
    }

    #[test]
    fn exhaustion_is_not_a_load_error() {
        let (_file, map) = scratch(4096);
        let mut alloc = UdmaBufAllocator::from_region(map, 0);
        let _held = alloc.allocate(512).unwrap();
        let err = alloc.allocate(1024).unwrap_err();
        assert!(matches!(
            err,
            ToyNetError::BufferExhausted {
                requested: 4096,
                free: 2048
            }
        ));
    }

    #[test]
    fn leased_region_is_zeroed() {
        let (_file, map) = scratch(4096);
        let mut alloc = UdmaBufAllocator::from_region(map, 0);
        let mut first = alloc.allocate(8).unwrap();
        first.as_words_mut().fill(0xFFFF_FFFF);
        drop(first);
        assert!(alloc.allocate(8).unwrap().as_words().iter().all(|&w| w == 0));
    }

    #[test]
    fn engine_programs_address_and_length() {
        let (_regs_file, regs) = scratch(axi_dma::REGION_SIZE as u64);
        let (_buf_file, buf) = scratch(4096);
        let regs = Arc::new(regs);
        let mut alloc = UdmaBufAllocator::from_region(buf, 0x2_0000_0040);
        let mut region = alloc.allocate(16).unwrap();

        let mut engine = AxiDmaEngine::new(Arc::clone(&regs), Direction::Receive, None);
        engine.start(&mut region, 10).unwrap();
        assert_eq!(regs.read32(axi_dma::S2MM_DA), 0x0000_0040);
        assert_eq!(regs.read32(axi_dma::S2MM_DA_MSB), 0x2);
        assert_eq!(regs.read32(axi_dma::S2MM_LENGTH), 40);

        regs.write32(axi_dma::S2MM_DMASR, status::IDLE);
        engine.complete(&mut region, 10).unwrap();
    }

    #[test]
    fn engine_rejects_heap_buffer() {
        let (_file, regs) = scratch(axi_dma::REGION_SIZE as u64);
        let mut engine = AxiDmaEngine::new(Arc::new(regs), Direction::Send, None);
        assert!(engine.start(&mut DmaRegion::heap(4), 4).is_err());
    }

    #[test]
    fn error_bits_are_hardware_errors() {
        let (_file, regs) = scratch(axi_dma::REGION_SIZE as u64);
        let regs = Arc::new(regs);
        regs.write32(axi_dma::MM2S_DMASR, status::SLAVE_ERROR);
        let mut engine = AxiDmaEngine::new(regs, Direction::Send, None);
        let err = engine.complete(&mut DmaRegion::heap(1), 1).unwrap_err();
        assert!(matches!(err, ToyNetError::HardwareError { .. }));
    }

    #[test]
    fn busy_channel_times_out() {
        let (_file, regs) = scratch(axi_dma::REGION_SIZE as u64);
        let mut engine = AxiDmaEngine::new(Arc::new(regs), Direction::Send, Some(Duration::from_millis(5)));
        let err = engine.complete(&mut DmaRegion::heap(1), 1).unwrap_err();
        assert!(matches!(err, ToyNetError::Timeout { duration_ms: 5 }));
    }

    #[test]
    fn control_bits() {
        let (_file, regs) = scratch(ap_ctrl::REGION_SIZE as u64);
        let mut control = HlsControl::from_region(regs);
        control.start().unwrap();
        assert_eq!(control.regs.read32(ap_ctrl::CTRL), 0x01);
        control.enable_auto_restart().unwrap();
        assert_eq!(control.regs.read32(ap_ctrl::CTRL), 0x81);
    }
}
