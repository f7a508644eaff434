// SPDX-License-Identifier: AGPL-3.0-only

//! Inference session: weight-load handshake and the two inference protocols
//!
//! ```text
//!            load_weights()                ack accepted
//!   Idle ─────────────────▶ WeightsLoaded ─────────────▶ Ready ──┐
//!     ▲                          │                        ▲      │ infer_serial()
//!     │                          │ ack rejected           └──────┘ infer_pipelined()
//!     │                          ▼
//!     └──── load_weights() ── Faulted ◀──── any transfer fault
//! ```
//!
//! Any error raised after the first transfer leaves the session `Faulted`.
//! Outstanding transfers are abandoned at that point and the only way
//! forward is a fresh weight load. Nothing is retried.

use crate::accelerator::Accelerator;
use crate::blob::WeightBlob;
use crate::buffer::SlotId;
use crate::command::{Command, CommandWord};
use crate::error::{Result, ToyNetError};
use crate::inference::{BatchOutput, InputBatch, LoadReport, OutputVector};
use std::fmt;
use std::time::Instant;
use toynet_chip::arch::{NUM_CLASSES, SAMPLE_LEN};
use toynet_chip::wire::COMMAND_MAX_WORDS;
use tracing::{debug, info, warn};

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No weights sent yet
    Idle,
    /// Weight stream sent, acknowledgement not yet verified
    WeightsLoaded,
    /// Acknowledgement verified; inference allowed
    Ready,
    /// A step failed; only a new weight load is allowed
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WeightsLoaded => write!(f, "weights-loaded"),
            Self::Ready => write!(f, "ready"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Protocol driver over one opened accelerator
///
/// The session owns four fixed buffers for its lifetime: the command word,
/// the acknowledgement word, one input sample, and one output vector.
/// Weight and batch buffers are allocated per call.
#[derive(Debug)]
pub struct InferenceSession<'a> {
    accelerator: &'a mut Accelerator,
    state: SessionState,
    command: SlotId,
    ack: SlotId,
    sample: SlotId,
    output: SlotId,
}

impl<'a> InferenceSession<'a> {
    /// Start a session in `Idle`.
    ///
    /// # Errors
    ///
    /// Returns error if the session buffers cannot be allocated.
    pub fn new(accelerator: &'a mut Accelerator) -> Result<Self> {
        let command = accelerator.allocate(COMMAND_MAX_WORDS)?;
        let ack = accelerator.allocate(1)?;
        let sample = accelerator.allocate(SAMPLE_LEN)?;
        let output = accelerator.allocate(NUM_CLASSES)?;
        Ok(Self {
            accelerator,
            state: SessionState::Idle,
            command,
            ack,
            sample,
            output,
        })
    }

    /// Current protocol state
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Accelerator the session drives
    pub fn accelerator(&self) -> &Accelerator {
        &*self.accelerator
    }

    /// Run the weight-load handshake.
    ///
    /// Allowed from `Idle` and `Faulted`. On success the session is `Ready`.
    ///
    /// # Errors
    ///
    /// - `Layout` if the blob length differs from the image's `blob_words`
    ///   (checked before anything is sent)
    /// - `TransferFailed` / `HardwareError` / `Timeout` from any wait
    /// - `ProtocolViolation` if the acknowledgement is rejected
    pub fn load_weights(&mut self, blob: &WeightBlob) -> Result<LoadReport> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Faulted => {
                info!("Session: recovering from fault with a fresh weight load");
                self.accelerator.abort()?;
            }
            state => {
                return Err(ToyNetError::invalid_state(format!(
                    "weight load is only allowed from idle or faulted, session is {state}"
                )))
            }
        }
        let result = self.handshake(blob);
        self.settle(result)
    }

    /// Protocol B: one command, one sample, one output at a time.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the session is `Ready`; any transfer
    /// fault faults the session.
    pub fn infer_serial(&mut self, batch: &InputBatch) -> Result<BatchOutput> {
        self.require_ready()?;
        let command = self.accelerator.encoder().encode(Command::infer(1)?)?;
        let result = self.run_serial(command, batch);
        self.settle(result)
    }

    /// Protocol C: one command for the whole batch, input streamed in one
    /// transfer, outputs drained one vector at a time.
    ///
    /// Produces the same outputs as [`Self::infer_serial`] on the same
    /// inputs; only the scheduling differs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the session is `Ready`,
    /// `InvalidCommand` if the image's command layout cannot announce the
    /// batch size, and any transfer fault (which faults the session).
    pub fn infer_pipelined(&mut self, batch: &InputBatch) -> Result<BatchOutput> {
        self.require_ready()?;
        let command = self.accelerator.encoder().encode(Command::infer(batch.len())?)?;
        let result = self.run_pipelined(command, batch);
        self.settle(result)
    }

    fn require_ready(&self) -> Result<()> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(ToyNetError::invalid_state(format!(
                "inference needs a ready session, session is {}",
                self.state
            )))
        }
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("Session faulted in state {}: {e}", self.state);
            self.state = SessionState::Faulted;
            if let Err(abort) = self.accelerator.abort() {
                warn!("Abandoning outstanding transfers failed: {abort}");
            }
        }
        result
    }

    fn handshake(&mut self, blob: &WeightBlob) -> Result<LoadReport> {
        let protocol = self.accelerator.image().protocol;
        if blob.len() != protocol.blob_words {
            warn!(
                "Weight blob has {} words, image {:?} expects {}",
                blob.len(),
                self.accelerator.image().name,
                protocol.blob_words
            );
            return Err(ToyNetError::layout("weight blob vs image", protocol.blob_words, blob.len()));
        }

        let start = Instant::now();
        let command = self.accelerator.encoder().encode(Command::WeightLoad)?;
        self.send_command(command)?;

        self.with_scratch(blob.len(), |session, slot| {
            let dst = session.accelerator.pool_mut().words_mut(slot)?;
            for (word, value) in dst.iter_mut().zip(blob.words()) {
                *word = value;
            }
            session.accelerator.send(slot, blob.len())?;
            session.accelerator.wait_send()
        })?;
        self.state = SessionState::WeightsLoaded;
        debug!("Session: {} weight words streamed", blob.len());

        self.accelerator.recv(self.ack, 1)?;
        self.accelerator.wait_recv()?;
        let ack = self.accelerator.pool().words(self.ack)?[0];
        if !protocol.ack.accepts(ack, blob.len()) {
            warn!("Weight-load ack {ack:#x} rejected ({:?})", protocol.ack);
            return Err(ToyNetError::protocol_violation(format!(
                "weight-load acknowledgement {ack:#x} does not satisfy {:?}",
                protocol.ack
            )));
        }

        self.state = SessionState::Ready;
        let report = LoadReport {
            words: blob.len(),
            ack,
            elapsed: start.elapsed(),
        };
        info!("Session ready: {} weight words, ack {ack}, {:?}", report.words, report.elapsed);
        Ok(report)
    }

    fn run_serial(&mut self, command: CommandWord, batch: &InputBatch) -> Result<BatchOutput> {
        let start = Instant::now();
        let mut outputs = Vec::with_capacity(batch.len());
        for sample in batch.samples() {
            self.send_command(command)?;
            self.accelerator.pool_mut().write_f32(self.sample, sample)?;
            self.accelerator.send(self.sample, SAMPLE_LEN)?;
            self.accelerator.wait_send()?;
            outputs.push(self.receive_output()?);
        }
        let out = BatchOutput {
            outputs,
            elapsed: start.elapsed(),
        };
        info!(
            "Serial inference: {} samples, {:.1} us/sample",
            out.len(),
            out.latency_us_per_sample()
        );
        Ok(out)
    }

    fn run_pipelined(&mut self, command: CommandWord, batch: &InputBatch) -> Result<BatchOutput> {
        let start = Instant::now();
        let input_words = batch.as_slice().len();
        let outputs = self.with_scratch(input_words, |session, input| {
            session.accelerator.pool_mut().write_f32(input, batch.as_slice())?;
            session.send_command(command)?;
            // Input stays in flight while outputs are drained
            session.accelerator.send(input, input_words)?;
            let mut outputs = Vec::with_capacity(batch.len());
            for _ in 0..batch.len() {
                outputs.push(session.receive_output()?);
            }
            session.accelerator.wait_send()?;
            Ok(outputs)
        })?;
        let out = BatchOutput {
            outputs,
            elapsed: start.elapsed(),
        };
        info!(
            "Pipelined inference: {} samples, {:.1} us/sample",
            out.len(),
            out.latency_us_per_sample()
        );
        Ok(out)
    }

    fn send_command(&mut self, command: CommandWord) -> Result<()> {
        self.accelerator.pool_mut().write_words(self.command, command.as_words())?;
        self.accelerator.send(self.command, command.len())?;
        self.accelerator.wait_send()
    }

    fn receive_output(&mut self) -> Result<OutputVector> {
        self.accelerator.recv(self.output, NUM_CLASSES)?;
        self.accelerator.wait_recv()?;
        OutputVector::from_slice(&self.accelerator.pool().read_f32(self.output, NUM_CLASSES)?)
    }

    /// Run `f` with a temporary buffer of `words` words, released afterwards.
    fn with_scratch<T>(
        &mut self,
        words: usize,
        f: impl FnOnce(&mut Self, SlotId) -> Result<T>,
    ) -> Result<T> {
        let slot = self.accelerator.allocate(words)?;
        let result = f(self, slot);
        if result.is_err() {
            // Slot may still be referenced by an abandoned transfer
            if let Err(abort) = self.accelerator.abort() {
                warn!("Abandoning outstanding transfers failed: {abort}");
            }
        }
        match (result, self.accelerator.release(slot)) {
            (Err(e), Err(release)) => {
                warn!("Scratch buffer not released after fault: {release}");
                Err(e)
            }
            (Ok(_), Err(release)) => Err(release),
            (result, Ok(_)) => result,
        }
    }
}

impl Drop for InferenceSession<'_> {
    fn drop(&mut self) {
        for slot in [self.command, self.ack, self.sample, self.output] {
            if let Err(e) = self.accelerator.release(slot) {
                warn!("Session buffer not released: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::AcceleratorImage;

    #[test]
    fn scratch_failure_keeps_original_error() {
        let mut acc = Accelerator::open(AcceleratorImage::software("scratch")).unwrap();
        let mut session = InferenceSession::new(&mut acc).unwrap();
        let err = session
            .with_scratch(16, |session, slot| -> Result<()> {
                session.accelerator.release(slot)?;
                Err(ToyNetError::transfer_failed("stalled"))
            })
            .unwrap_err();
        assert!(matches!(err, ToyNetError::TransferFailed { .. }), "{err}");
    }

    #[test]
    fn scratch_release_failure_reported_on_success() {
        let mut acc = Accelerator::open(AcceleratorImage::software("scratch")).unwrap();
        let mut session = InferenceSession::new(&mut acc).unwrap();
        let err = session
            .with_scratch(16, |session, slot| session.accelerator.release(slot))
            .unwrap_err();
        assert!(matches!(err, ToyNetError::InvalidSlot { .. }));
    }

    #[test]
    fn scratch_is_returned_to_pool() {
        let mut acc = Accelerator::open(AcceleratorImage::software("scratch")).unwrap();
        let mut session = InferenceSession::new(&mut acc).unwrap();
        let slot = session.with_scratch(16, |_, slot| Ok(slot)).unwrap();
        assert!(matches!(
            session.accelerator().pool().capacity(slot),
            Err(ToyNetError::InvalidSlot { .. })
        ));
    }
}
