// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol A: raw channel throughput
//!
//! One send and one equally sized receive are enqueued back to back, then
//! only the receive is awaited. No command or weight semantics are
//! involved, so this is meant for a loopback image. Throughput counts both
//! directions:
//!
//! ```text
//! Mbps = words × 32 / 1024 / 1024 / seconds × 2
//! ```

use crate::accelerator::Accelerator;
use crate::buffer::SlotId;
use crate::error::{Result, ToyNetError};
use std::time::{Duration, Instant};
use toynet_chip::wire::{LOOPBACK_INCREMENT, WORD_BITS};
use tracing::{info, warn};

/// Timing of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputReport {
    /// Words moved in each direction
    pub words: usize,
    /// Bits per word on the stream
    pub bits_per_word: u32,
    /// Time from first submission until the receive completed
    pub elapsed: Duration,
}

impl ThroughputReport {
    /// Combined send + receive throughput in Mbit/s (binary mega)
    pub fn mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.words as f64 * f64::from(self.bits_per_word) / 1024.0 / 1024.0 / secs * 2.0
    }

    /// Elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1e3
    }
}

/// Probe result with the data that came back
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Timing
    pub report: ThroughputReport,
    /// Words that were sent
    pub sent: Vec<u32>,
    /// Words that came back
    pub received: Vec<u32>,
}

impl ProbeOutcome {
    /// Received words that are not the sent word plus the loopback increment
    pub fn loopback_mismatches(&self) -> usize {
        self.sent
            .iter()
            .zip(&self.received)
            .filter(|(s, r)| s.wrapping_add(LOOPBACK_INCREMENT) != **r)
            .count()
    }
}

/// Run Protocol A with `data` as the send payload.
///
/// # Errors
///
/// Returns error if `data` is empty, the buffers cannot be allocated, or a
/// channel reports a fault.
pub fn probe_throughput(accelerator: &mut Accelerator, data: Vec<u32>) -> Result<ProbeOutcome> {
    if data.is_empty() {
        return Err(ToyNetError::invalid_state("throughput probe needs at least one word"));
    }
    let words = data.len();
    let send = accelerator.allocate(words)?;
    let recv = match accelerator.allocate(words) {
        Ok(slot) => slot,
        Err(e) => {
            accelerator.release(send)?;
            return Err(e);
        }
    };

    let result = run(accelerator, send, recv, &data);
    if result.is_err() {
        if let Err(abort) = accelerator.abort() {
            warn!("Probe: abandoning transfers failed: {abort}");
        }
    }
    accelerator.release(send)?;
    accelerator.release(recv)?;

    let (report, received) = result?;
    info!(
        "Probe: {words} words in {:.3} ms, {:.1} Mbps",
        report.elapsed_ms(),
        report.mbps()
    );
    Ok(ProbeOutcome {
        report,
        sent: data,
        received,
    })
}

fn run(
    accelerator: &mut Accelerator,
    send: SlotId,
    recv: SlotId,
    data: &[u32],
) -> Result<(ThroughputReport, Vec<u32>)> {
    let words = data.len();
    accelerator.pool_mut().write_words(send, data)?;

    let start = Instant::now();
    accelerator.send(send, words)?;
    accelerator.recv(recv, words)?;
    accelerator.wait_recv()?;
    let elapsed = start.elapsed();
    accelerator.wait_send()?;

    let received = accelerator.pool().words(recv)?.to_vec();
    Ok((
        ThroughputReport {
            words,
            bits_per_word: WORD_BITS,
            elapsed,
        },
        received,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::AcceleratorImage;
    use toynet_chip::wire::PROBE_WORDS;

    #[test]
    fn throughput_formula() {
        let report = ThroughputReport {
            words: PROBE_WORDS,
            bits_per_word: 32,
            elapsed: Duration::from_millis(10),
        };
        assert!((report.mbps() - 51_200.0).abs() < 1e-6);
    }

    #[test]
    fn zero_elapsed_is_zero_throughput() {
        let report = ThroughputReport {
            words: 4,
            bits_per_word: 32,
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.mbps(), 0.0);
    }

    #[test]
    fn loopback_echo_plus_increment() {
        let mut acc = Accelerator::open(AcceleratorImage::loopback("echo")).unwrap();
        let outcome = probe_throughput(&mut acc, (0..1024).collect()).unwrap();
        assert_eq!(outcome.received[0], 13);
        assert_eq!(outcome.received[1023], 1023 + 13);
        assert_eq!(outcome.loopback_mismatches(), 0);
        assert_eq!(acc.pool().in_flight_count(), 0);
    }

    #[test]
    fn empty_probe_rejected() {
        let mut acc = Accelerator::open(AcceleratorImage::loopback("echo")).unwrap();
        assert!(probe_throughput(&mut acc, Vec::new()).is_err());
    }
}
