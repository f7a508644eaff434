// SPDX-License-Identifier: AGPL-3.0-only

//! Word-level wire constants of the reference accelerator build.
//!
//! These are the defaults used when an accelerator image does not override
//! them. Other builds may use different codes; the driver treats every value
//! here as configuration, not as a fixed protocol constant.

/// Bytes per stream word.
pub const WORD_BYTES: usize = 4;

/// Bits per stream word.
pub const WORD_BITS: u32 = 32;

/// Command codes carried in the first command word.
pub mod mode {
    /// Load the parameter stream that follows.
    pub const WEIGHT_LOAD: u32 = 1;
    /// Run inference on the samples that follow.
    pub const INFER: u32 = 2;
}

/// Maximum words in one command (mode, count).
pub const COMMAND_MAX_WORDS: usize = 2;

/// Acknowledgement word written after a complete weight load.
pub const ACK_WORD: u32 = 1;

/// Value the empty (loopback) overlay adds to every echoed word.
pub const LOOPBACK_INCREMENT: u32 = 13;

/// Default size of the raw throughput probe: 8,388,608 words (32 MiB).
pub const PROBE_WORDS: usize = 256 << 15;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_32_mib() {
        assert_eq!(PROBE_WORDS, 8_388_608);
        assert_eq!(PROBE_WORDS * WORD_BYTES, 32 * 1024 * 1024);
    }

    #[test]
    fn modes_are_distinct() {
        assert_ne!(mode::WEIGHT_LOAD, mode::INFER);
    }
}
