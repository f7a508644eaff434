// SPDX-License-Identifier: AGPL-3.0-only

//! Register maps used by the memory-mapped driver.
//!
//! Two blocks are exposed through UIO on the reference board:
//!
//! ```text
//! AXI DMA (simple/register mode)      HLS kernel control (s_axilite)
//! 0x00 MM2S_DMACR                      0x00 AP_CTRL
//! 0x04 MM2S_DMASR                           bit 0 AP_START
//! 0x18 MM2S_SA / 0x1C MM2S_SA_MSB           bit 1 AP_DONE
//! 0x28 MM2S_LENGTH                          bit 2 AP_IDLE
//! 0x30 S2MM_DMACR                           bit 3 AP_READY
//! 0x34 S2MM_DMASR                           bit 7 AUTO_RESTART
//! 0x48 S2MM_DA / 0x4C S2MM_DA_MSB
//! 0x58 S2MM_LENGTH
//! ```

/// AXI DMA register offsets and bits.
pub mod axi_dma {
    /// Memory-to-stream (send) control register.
    pub const MM2S_DMACR: usize = 0x00;
    /// Memory-to-stream status register.
    pub const MM2S_DMASR: usize = 0x04;
    /// Memory-to-stream source address (low 32 bits).
    pub const MM2S_SA: usize = 0x18;
    /// Memory-to-stream source address (high 32 bits).
    pub const MM2S_SA_MSB: usize = 0x1C;
    /// Memory-to-stream transfer length in bytes; writing starts the transfer.
    pub const MM2S_LENGTH: usize = 0x28;

    /// Stream-to-memory (receive) control register.
    pub const S2MM_DMACR: usize = 0x30;
    /// Stream-to-memory status register.
    pub const S2MM_DMASR: usize = 0x34;
    /// Stream-to-memory destination address (low 32 bits).
    pub const S2MM_DA: usize = 0x48;
    /// Stream-to-memory destination address (high 32 bits).
    pub const S2MM_DA_MSB: usize = 0x4C;
    /// Stream-to-memory buffer length in bytes; writing starts the transfer.
    pub const S2MM_LENGTH: usize = 0x58;

    /// Size of the register window.
    pub const REGION_SIZE: usize = 0x1000;

    /// Largest length the default 26-bit length register accepts.
    pub const MAX_TRANSFER_BYTES: usize = (1 << 26) - 1;

    /// DMACR bits.
    pub mod control {
        /// Run/stop.
        pub const RUN: u32 = 1 << 0;
        /// Soft reset.
        pub const RESET: u32 = 1 << 2;
    }

    /// DMASR bits.
    pub mod status {
        /// Channel halted.
        pub const HALTED: u32 = 1 << 0;
        /// Channel idle (transfer complete).
        pub const IDLE: u32 = 1 << 1;
        /// Internal error.
        pub const INTERNAL_ERROR: u32 = 1 << 4;
        /// Slave error.
        pub const SLAVE_ERROR: u32 = 1 << 5;
        /// Decode error.
        pub const DECODE_ERROR: u32 = 1 << 6;
        /// Interrupt on complete.
        pub const IOC_IRQ: u32 = 1 << 12;
        /// Error interrupt.
        pub const ERR_IRQ: u32 = 1 << 14;
        /// Any error bit.
        pub const ERROR_MASK: u32 = INTERNAL_ERROR | SLAVE_ERROR | DECODE_ERROR;
    }
}

/// HLS block-level control register.
pub mod ap_ctrl {
    /// Control register offset.
    pub const CTRL: usize = 0x00;
    /// Size of the register window.
    pub const REGION_SIZE: usize = 0x1000;
    /// Start the kernel.
    pub const AP_START: u32 = 1 << 0;
    /// Kernel finished its last invocation.
    pub const AP_DONE: u32 = 1 << 1;
    /// Kernel idle.
    pub const AP_IDLE: u32 = 1 << 2;
    /// Kernel ready for new input.
    pub const AP_READY: u32 = 1 << 3;
    /// Restart automatically after each invocation.
    pub const AUTO_RESTART: u32 = 1 << 7;
}
