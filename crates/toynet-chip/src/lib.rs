// SPDX-License-Identifier: AGPL-3.0-only

//! Silicon model for the ToyNet fixed-function inference accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the accelerator expects on its AXI4-Stream input: the
//! reference network layout, the command codes, the acknowledgement word, and
//! the register maps of the AXI DMA engine and the HLS control block.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`arch`] | Reference layer shapes, weight blob length (61,750 words) |
//! | [`wire`] | Command codes, ack word, word width, probe size |
//! | [`regs`] | AXI DMA (simple mode) and HLS `ap_ctrl` register maps |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arch;
pub mod regs;
pub mod wire;
