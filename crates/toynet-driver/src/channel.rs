// SPDX-License-Identifier: AGPL-3.0-only

//! Directional DMA channels
//!
//! A [`TransferChannel`] wraps one [`DmaEngine`]. `transfer()` enqueues and
//! returns immediately; `wait()` blocks until the most recently enqueued
//! transfer has completed. Transfers on one channel complete in submission
//! order, so waiting on the newest one retires every older one too.
//!
//! Send and receive channels are independent. Any ordering between them is
//! whatever the caller enforces by placing `wait()` calls.

use crate::buffer::{DmaPool, DmaRegion, SlotId};
use crate::error::{Result, ToyNetError};
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use tracing::debug;

/// Direction of a DMA channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host memory to accelerator stream (MM2S)
    Send,
    /// Accelerator stream to host memory (S2MM)
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// One directional DMA engine
///
/// Implementations move `words` words between `region` and the accelerator.
/// `start` must not block on completion; `complete` blocks until the
/// transfer started with the same region has finished.
pub trait DmaEngine: Debug + Send {
    /// Direction this engine moves data in
    fn direction(&self) -> Direction;

    /// Transfers the engine can have outstanding at once
    fn max_outstanding(&self) -> usize {
        usize::MAX
    }

    /// Begin a transfer over the first `words` words of `region`.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot accept the transfer.
    fn start(&mut self, region: &mut DmaRegion, words: usize) -> Result<()>;

    /// Block until the oldest outstanding transfer has finished.
    ///
    /// # Errors
    ///
    /// Returns error if the hardware reports a fault.
    fn complete(&mut self, region: &mut DmaRegion, words: usize) -> Result<()>;

    /// Abandon every outstanding transfer and return the engine to idle.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be reset.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Synchronization wrapper around one DMA engine
#[derive(Debug)]
pub struct TransferChannel {
    engine: Box<dyn DmaEngine>,
    pending: VecDeque<(SlotId, usize)>,
    submitted: u64,
    completed: u64,
}

impl TransferChannel {
    /// Wrap `engine`
    pub fn new(engine: Box<dyn DmaEngine>) -> Self {
        Self {
            engine,
            pending: VecDeque::new(),
            submitted: 0,
            completed: 0,
        }
    }

    /// Direction of the wrapped engine
    pub fn direction(&self) -> Direction {
        self.engine.direction()
    }

    /// True when no transfer is outstanding
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Transfers submitted over the channel's lifetime
    pub const fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Transfers completed successfully over the channel's lifetime
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    /// Enqueue a transfer of the whole slot.
    ///
    /// # Errors
    ///
    /// See [`TransferChannel::transfer_words`].
    pub fn transfer(&mut self, pool: &mut DmaPool, slot: SlotId) -> Result<()> {
        let words = pool.capacity(slot)?;
        self.transfer_words(pool, slot, words)
    }

    /// Enqueue a transfer of the first `words` words of `slot`.
    ///
    /// The slot stays in flight until the `wait()` that retires it returns.
    ///
    /// # Errors
    ///
    /// Returns error if the slot is already in flight, the engine queue is
    /// full, or the engine refuses the transfer.
    pub fn transfer_words(&mut self, pool: &mut DmaPool, slot: SlotId, words: usize) -> Result<()> {
        let direction = self.engine.direction();
        if self.pending.len() >= self.engine.max_outstanding() {
            return Err(ToyNetError::invalid_state(format!(
                "{direction} channel busy: {} transfer(s) outstanding",
                self.pending.len()
            )));
        }

        let region = pool.begin_transfer(slot, direction, words)?;
        if let Err(e) = self.engine.start(region, words) {
            pool.end_transfer(slot);
            return Err(e);
        }

        self.pending.push_back((slot, words));
        self.submitted += 1;
        debug!(
            "{direction}: submitted {words} words from slot {} ({} pending)",
            slot.index(),
            self.pending.len()
        );
        Ok(())
    }

    /// Block until every outstanding transfer has completed.
    ///
    /// All in-flight flags owned by this channel are cleared before
    /// returning, also on failure. After a failure the remaining transfers
    /// are abandoned and the engine is reset; the session that issued them
    /// must not continue.
    ///
    /// # Errors
    ///
    /// Returns the first fault reported by the engine.
    pub fn wait(&mut self, pool: &mut DmaPool) -> Result<()> {
        let direction = self.engine.direction();
        let mut outcome = Ok(());

        while let Some((slot, words)) = self.pending.pop_front() {
            if outcome.is_ok() {
                outcome = pool
                    .in_flight_region(slot)
                    .and_then(|region| self.engine.complete(region, words));
                if outcome.is_ok() {
                    self.completed += 1;
                    debug!("{direction}: completed {words} words into slot {}", slot.index());
                }
            }
            pool.end_transfer(slot);
        }

        if let Err(e) = &outcome {
            tracing::warn!("{direction} channel fault: {e}");
            if let Err(reset) = self.engine.reset() {
                tracing::warn!("{direction} channel reset failed: {reset}");
            }
        }
        outcome
    }

    /// Abandon every outstanding transfer without waiting for it.
    ///
    /// Clears the in-flight flags and resets the engine, also when nothing
    /// is outstanding, so data the accelerator already queued is discarded.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be reset.
    pub fn abort(&mut self, pool: &mut DmaPool) -> Result<()> {
        if !self.pending.is_empty() {
            let direction = self.engine.direction();
            tracing::warn!("{direction}: abandoning {} outstanding transfer(s)", self.pending.len());
            for (slot, _) in self.pending.drain(..) {
                pool.end_transfer(slot);
            }
        }
        self.engine.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the order of completions and fails on request
    #[derive(Debug, Default)]
    struct ScriptedEngine {
        limit: Option<usize>,
        fail_at: Option<usize>,
        completions: usize,
        resets: usize,
    }

    impl DmaEngine for ScriptedEngine {
        fn direction(&self) -> Direction {
            Direction::Send
        }

        fn max_outstanding(&self) -> usize {
            self.limit.unwrap_or(usize::MAX)
        }

        fn start(&mut self, _region: &mut DmaRegion, _words: usize) -> Result<()> {
            Ok(())
        }

        fn complete(&mut self, _region: &mut DmaRegion, _words: usize) -> Result<()> {
            self.completions += 1;
            if self.fail_at == Some(self.completions) {
                return Err(ToyNetError::transfer_failed("scripted"));
            }
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }
    }

    fn pool_with(slots: usize) -> (DmaPool, Vec<SlotId>) {
        let mut pool = DmaPool::new();
        let ids = (0..slots).map(|_| pool.insert(DmaRegion::heap(4))).collect();
        (pool, ids)
    }

    #[test]
    fn wait_retires_every_pending_transfer() {
        let (mut pool, ids) = pool_with(3);
        let mut channel = TransferChannel::new(Box::<ScriptedEngine>::default());
        for &id in &ids {
            channel.transfer(&mut pool, id).unwrap();
        }
        assert_eq!(pool.in_flight_count(), 3);
        channel.wait(&mut pool).unwrap();
        assert!(channel.is_idle());
        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(channel.completed(), 3);
    }

    #[test]
    fn same_slot_twice_is_rejected() {
        let (mut pool, ids) = pool_with(1);
        let mut channel = TransferChannel::new(Box::<ScriptedEngine>::default());
        channel.transfer(&mut pool, ids[0]).unwrap();
        let err = channel.transfer(&mut pool, ids[0]).unwrap_err();
        assert!(matches!(err, ToyNetError::BufferInFlight { .. }));
    }

    #[test]
    fn queue_limit_enforced() {
        let (mut pool, ids) = pool_with(2);
        let engine = ScriptedEngine {
            limit: Some(1),
            ..ScriptedEngine::default()
        };
        let mut channel = TransferChannel::new(Box::new(engine));
        channel.transfer(&mut pool, ids[0]).unwrap();
        assert!(channel.transfer(&mut pool, ids[1]).is_err());
        assert!(!pool.is_in_flight(ids[1]));
    }

    #[test]
    fn failure_clears_flags() {
        let (mut pool, ids) = pool_with(3);
        let engine = ScriptedEngine {
            fail_at: Some(1),
            ..ScriptedEngine::default()
        };
        let mut channel = TransferChannel::new(Box::new(engine));
        for &id in &ids {
            channel.transfer(&mut pool, id).unwrap();
        }
        assert!(channel.wait(&mut pool).is_err());
        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(channel.completed(), 0);
    }

    #[test]
    fn abort_releases_without_completing() {
        let (mut pool, ids) = pool_with(2);
        let mut channel = TransferChannel::new(Box::<ScriptedEngine>::default());
        channel.transfer_words(&mut pool, ids[0], 2).unwrap();
        channel.abort(&mut pool).unwrap();
        assert!(channel.is_idle());
        assert!(!pool.is_in_flight(ids[0]));
        assert_eq!(channel.completed(), 0);
    }
}
