// SPDX-License-Identifier: AGPL-3.0-only

//! Command words
//!
//! Every request to the accelerator starts with one or two 32-bit words:
//!
//! ```text
//! WeightLoad : [ weight_load_code ]
//! Infer      : [ infer_code, count ]   (count_field = second-word)
//!              [ infer_code ]          (count_field = absent, count must be 1)
//! ```
//!
//! The codes and the presence of the count word belong to the accelerator
//! build and come from the image manifest. [`CommandEncoder::encode`] is the
//! only place where command words are produced.

use crate::error::{Result, ToyNetError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use toynet_chip::wire::{mode, COMMAND_MAX_WORDS};

/// Operation requested from the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Parameter stream follows
    WeightLoad,
    /// `count` concatenated samples follow
    Infer {
        /// Number of samples
        count: NonZeroU32,
    },
}

impl Command {
    /// Inference command for `count` samples.
    ///
    /// # Errors
    ///
    /// Returns error if `count` is zero or does not fit in a 32-bit word.
    pub fn infer(count: usize) -> Result<Self> {
        let count = u32::try_from(count)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                ToyNetError::invalid_command(format!("sample count must be in 1..=u32::MAX, got {count}"))
            })?;
        Ok(Self::Infer { count })
    }
}

/// Where the sample count travels for `Infer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CountField {
    /// Count is the second word
    #[default]
    SecondWord,
    /// One-word commands; the accelerator processes exactly one sample
    Absent,
}

/// Control-word layout of one accelerator build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandLayout {
    /// Code for `WeightLoad`
    pub weight_load_code: u32,
    /// Code for `Infer`
    pub infer_code: u32,
    /// Count encoding for `Infer`
    pub count_field: CountField,
}

impl Default for CommandLayout {
    fn default() -> Self {
        Self {
            weight_load_code: mode::WEIGHT_LOAD,
            infer_code: mode::INFER,
            count_field: CountField::SecondWord,
        }
    }
}

/// Encoded command, one or two words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandWord {
    words: [u32; COMMAND_MAX_WORDS],
    len: usize,
}

impl CommandWord {
    /// Words in wire order
    pub fn as_words(&self) -> &[u32] {
        &self.words[..self.len]
    }

    /// Number of words
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; a command has at least the mode word
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Builds command words for a fixed layout
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandEncoder {
    layout: CommandLayout,
}

impl CommandEncoder {
    /// Create encoder for `layout`.
    ///
    /// # Errors
    ///
    /// Returns error if both modes share the same code.
    pub fn new(layout: CommandLayout) -> Result<Self> {
        if layout.weight_load_code == layout.infer_code {
            return Err(ToyNetError::invalid_command(format!(
                "weight-load and infer codes must differ (both {})",
                layout.weight_load_code
            )));
        }
        Ok(Self { layout })
    }

    /// Layout in use
    pub const fn layout(&self) -> &CommandLayout {
        &self.layout
    }

    /// Largest batch a single `Infer` command can announce
    pub const fn max_batch(&self) -> u32 {
        match self.layout.count_field {
            CountField::SecondWord => u32::MAX,
            CountField::Absent => 1,
        }
    }

    /// Encode `command`.
    ///
    /// # Errors
    ///
    /// Returns error if the layout cannot express the requested count.
    pub fn encode(&self, command: Command) -> Result<CommandWord> {
        let mut words = [0u32; COMMAND_MAX_WORDS];
        let len = match (command, self.layout.count_field) {
            (Command::WeightLoad, _) => {
                words[0] = self.layout.weight_load_code;
                1
            }
            (Command::Infer { count }, CountField::SecondWord) => {
                words[0] = self.layout.infer_code;
                words[1] = count.get();
                2
            }
            (Command::Infer { count }, CountField::Absent) => {
                if count.get() != 1 {
                    return Err(ToyNetError::invalid_command(format!(
                        "layout has no count word; cannot announce {count} samples"
                    )));
                }
                words[0] = self.layout.infer_code;
                1
            }
        };
        Ok(CommandWord { words, len })
    }
}
