// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for accelerator transfer operations

use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, ToyNetError>;

/// Errors that can occur while driving the accelerator
///
/// None of these are retried by the driver. Recovering from any of them
/// means opening a new session and repeating the weight-load handshake.
#[derive(Debug, Error)]
pub enum ToyNetError {
    /// Accelerator image could not be turned into a usable handle
    #[error("Failed to load accelerator image: {reason}")]
    Load {
        /// Reason for failure
        reason: String,
    },

    /// Serialized weight length differs from the statically known total
    #[error("Weight layout mismatch ({context}): expected {expected} words, got {actual}")]
    Layout {
        /// Where the mismatch was found
        context: String,
        /// Words required by the architecture
        expected: usize,
        /// Words actually produced
        actual: usize,
    },

    /// Data transfer failed
    #[error("Transfer failed: {reason}")]
    TransferFailed {
        /// Reason for failure
        reason: String,
    },

    /// Hardware-level fault reported by a DMA engine
    #[error("Hardware error: {reason}")]
    HardwareError {
        /// Reason for failure
        reason: String,
    },

    /// Accelerator answered with something the protocol does not allow
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// Reason for failure
        reason: String,
    },

    /// Host touched a buffer that is still owned by a DMA engine
    #[error("Buffer slot {slot} is in flight and cannot be accessed until its wait completes")]
    BufferInFlight {
        /// Slot index in the DMA pool
        slot: usize,
    },

    /// DMA-capable memory has no gap large enough for a new buffer
    #[error("DMA memory exhausted: {requested} bytes requested, {free} free")]
    BufferExhausted {
        /// Bytes asked for
        requested: usize,
        /// Bytes not currently leased (possibly fragmented)
        free: usize,
    },

    /// Slot does not exist in the DMA pool
    #[error("Unknown buffer slot {slot}")]
    InvalidSlot {
        /// Slot index in the DMA pool
        slot: usize,
    },

    /// Operation not allowed in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Command cannot be encoded with the configured layout
    #[error("Invalid command: {reason}")]
    InvalidCommand {
        /// Reason for failure
        reason: String,
    },

    /// Caller-imposed wall-clock bound expired before completion
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// I/O error while opening or mapping device files
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl ToyNetError {
    /// Create a load error
    pub fn load(reason: impl Into<String>) -> Self {
        Self::Load {
            reason: reason.into(),
        }
    }

    /// Create a layout error
    pub fn layout(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::Layout {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Create a transfer failed error
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware_error(reason: impl Into<String>) -> Self {
        Self::HardwareError {
            reason: reason.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an invalid command error
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// True for faults reported on `wait()` (transfer or hardware level)
    pub const fn is_transfer_fault(&self) -> bool {
        matches!(
            self,
            Self::TransferFailed { .. } | Self::HardwareError { .. } | Self::Timeout { .. }
        )
    }
}
