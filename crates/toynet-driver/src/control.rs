// SPDX-License-Identifier: AGPL-3.0-only

//! Minimal accelerator control capability
//!
//! The protocol only needs to start the kernel and keep it restarting after
//! each command. Register offsets and bit positions are the concern of the
//! concrete backend.

use crate::error::Result;
use std::fmt::Debug;

/// Start/enable contract of an inference-capable accelerator image
pub trait AcceleratorControl: Debug + Send {
    /// Start the kernel.
    ///
    /// # Errors
    ///
    /// Returns error if the control interface rejects the write.
    fn start(&mut self) -> Result<()>;

    /// Make the kernel restart automatically after every command.
    ///
    /// # Errors
    ///
    /// Returns error if the control interface rejects the write.
    fn enable_auto_restart(&mut self) -> Result<()>;
}
