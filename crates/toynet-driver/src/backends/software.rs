// SPDX-License-Identifier: AGPL-3.0-only

//! Virtual accelerator
//!
//! Runs the accelerator side of the protocol in process so the full host
//! stack works without an FPGA. Two personalities are available:
//!
//! ```text
//! ToyNet   : decodes command words, consumes the weight stream, answers
//!            with the ack word its protocol calls for, and runs the f32
//!            reference network on every sample
//! Loopback : echoes every received word plus 13 (ap_ctrl_none image)
//! ```
//!
//! The ToyNet kernel only consumes its stream after `start()`. Without
//! auto-restart it goes idle again after one command, like an HLS block
//! whose `ap_start` was pulsed once.
//!
//! Both DMA engines fingerprint the region they were handed at `start()`
//! and check it again at completion. A host that touches a buffer while it
//! is in flight produces a `HardwareError` and a recorded violation. The
//! [`DeviceMonitor`] handle also injects faults on a chosen completion and
//! exposes the order in which transfers were started and retired.

use super::reference_net::ReferenceNet;
use super::BackendParts;
use crate::buffer::{DmaRegion, HeapAllocator};
use crate::channel::{Direction, DmaEngine};
use crate::command::{CommandLayout, CountField};
use crate::control::AcceleratorControl;
use crate::error::{Result, ToyNetError};
use crate::image::{AckPolicy, ProtocolConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use toynet_chip::arch::SAMPLE_LEN;
use toynet_chip::wire::{ACK_WORD, LOOPBACK_INCREMENT};
use tracing::{debug, info, warn};

/// Behaviour of the virtual accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualKind {
    /// ToyNet inference kernel
    ToyNet,
    /// Word echo with increment
    Loopback,
}

/// Counters kept by the virtual accelerator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Commands fully processed
    pub commands: u64,
    /// Weight loads fully consumed
    pub weight_loads: u64,
    /// Samples inferred
    pub samples: u64,
    /// Command words with an unknown mode code
    pub unknown_modes: u64,
    /// DMA completions (both directions)
    pub completions: u64,
}

/// Point in a transfer's life seen by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// Engine was handed the buffer
    Start,
    /// Host's wait retired the transfer successfully
    Complete,
}

/// One engine operation, in the order the device observed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    /// Channel direction
    pub direction: Direction,
    /// Start or completion
    pub stage: TransferStage,
    /// Words in the transfer
    pub words: usize,
}

impl TransferEvent {
    /// Event for `words` words on `direction` at `stage`
    pub const fn new(direction: Direction, stage: TransferStage, words: usize) -> Self {
        Self {
            direction,
            stage,
            words,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitMode,
    AwaitCount,
    LoadingWeights,
    Inferring { remaining: u32 },
}

#[derive(Debug)]
struct VirtualDevice {
    kind: VirtualKind,
    layout: CommandLayout,
    blob_words: usize,
    ack: AckPolicy,
    started: bool,
    auto_restart: bool,
    phase: Phase,
    input: VecDeque<u32>,
    output: VecDeque<u32>,
    net: ReferenceNet,
    stats: DeviceStats,
    fail_on_completion: Option<u64>,
    violations: Vec<String>,
    events: Vec<TransferEvent>,
}

impl VirtualDevice {
    fn new(kind: VirtualKind, protocol: &ProtocolConfig) -> Self {
        Self {
            kind,
            layout: protocol.command_layout(),
            blob_words: protocol.blob_words,
            ack: protocol.ack,
            started: false,
            auto_restart: false,
            phase: Phase::AwaitMode,
            input: VecDeque::new(),
            output: VecDeque::new(),
            net: ReferenceNet::zeroed(),
            stats: DeviceStats::default(),
            fail_on_completion: None,
            violations: Vec::new(),
            events: Vec::new(),
        }
    }

    fn accept(&mut self, words: &[u32]) {
        self.input.extend(words.iter().copied());
        self.process();
    }

    /// Count one completion; fails if it is the injected one.
    fn complete_one(&mut self, direction: Direction) -> Result<()> {
        self.stats.completions += 1;
        if self.fail_on_completion == Some(self.stats.completions) {
            self.fail_on_completion = None;
            warn!("virtual accelerator: injected {direction} fault at completion {}", self.stats.completions);
            return Err(ToyNetError::transfer_failed(format!(
                "injected {direction} fault at completion {}",
                self.stats.completions
            )));
        }
        Ok(())
    }

    fn record(&mut self, direction: Direction, stage: TransferStage, words: usize) {
        self.events.push(TransferEvent::new(direction, stage, words));
    }

    fn record_violation(&mut self, message: String) -> ToyNetError {
        warn!("virtual accelerator: {message}");
        self.violations.push(message.clone());
        ToyNetError::hardware_error(message)
    }

    fn process(&mut self) {
        if self.kind == VirtualKind::Loopback {
            let echoed = self.input.drain(..).map(|w| w.wrapping_add(LOOPBACK_INCREMENT));
            self.output.extend(echoed);
            return;
        }

        while self.started {
            match self.phase {
                Phase::AwaitMode => {
                    let Some(word) = self.input.pop_front() else {
                        return;
                    };
                    if word == self.layout.weight_load_code {
                        self.phase = Phase::LoadingWeights;
                    } else if word == self.layout.infer_code {
                        self.phase = match self.layout.count_field {
                            CountField::SecondWord => Phase::AwaitCount,
                            CountField::Absent => Phase::Inferring { remaining: 1 },
                        };
                    } else {
                        warn!("virtual accelerator: unknown mode word {word:#x}");
                        self.stats.unknown_modes += 1;
                        self.finish_command();
                    }
                }
                Phase::AwaitCount => {
                    let Some(count) = self.input.pop_front() else {
                        return;
                    };
                    if count == 0 {
                        self.finish_command();
                    } else {
                        self.phase = Phase::Inferring { remaining: count };
                    }
                }
                Phase::LoadingWeights => {
                    if self.input.len() < self.blob_words {
                        return;
                    }
                    let words: Vec<u32> = self.input.drain(..self.blob_words).collect();
                    match ReferenceNet::from_words(&words) {
                        Some(net) => self.net = net,
                        None => warn!(
                            "virtual accelerator: {}-word stream does not match the reference network",
                            words.len()
                        ),
                    }
                    self.stats.weight_loads += 1;
                    self.output.push_back(self.ack_word());
                    debug!("virtual accelerator: consumed {} weight words", words.len());
                    self.finish_command();
                }
                Phase::Inferring { remaining } => {
                    if self.input.len() < SAMPLE_LEN {
                        return;
                    }
                    let sample: Vec<f32> = self.input.drain(..SAMPLE_LEN).map(f32::from_bits).collect();
                    let scores = self.net.forward(&sample);
                    self.output.extend(scores.iter().map(|v| v.to_bits()));
                    self.stats.samples += 1;
                    if remaining > 1 {
                        self.phase = Phase::Inferring {
                            remaining: remaining - 1,
                        };
                    } else {
                        self.finish_command();
                    }
                }
            }
        }
    }

    /// Word this build answers a completed weight load with
    fn ack_word(&self) -> u32 {
        match self.ack {
            AckPolicy::Value { value } => value,
            AckPolicy::NonZero => ACK_WORD,
            AckPolicy::BlobLength => u32::try_from(self.blob_words).unwrap_or(u32::MAX),
        }
    }

    fn finish_command(&mut self) {
        self.phase = Phase::AwaitMode;
        self.stats.commands += 1;
        if !self.auto_restart {
            self.started = false;
        }
    }
}

type SharedDevice = Arc<Mutex<VirtualDevice>>;

fn lock(device: &Mutex<VirtualDevice>) -> Result<MutexGuard<'_, VirtualDevice>> {
    device
        .lock()
        .map_err(|_| ToyNetError::hardware_error("virtual accelerator state poisoned"))
}

/// FNV-1a over the transfer window
fn fingerprint(words: &[u32]) -> u64 {
    words.iter().fold(0xcbf2_9ce4_8422_2325, |hash, word| {
        word.to_le_bytes()
            .iter()
            .fold(hash, |h, &b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3))
    })
}

/// In-process accelerator with its two engines and control interface
#[derive(Debug)]
pub struct VirtualAccelerator {
    device: SharedDevice,
}

impl VirtualAccelerator {
    /// Create a virtual accelerator speaking `protocol`
    pub fn new(kind: VirtualKind, protocol: &ProtocolConfig) -> Self {
        info!("Virtual accelerator: {kind:?}");
        Self {
            device: Arc::new(Mutex::new(VirtualDevice::new(kind, protocol))),
        }
    }

    /// Handle for inspecting the device after it has been handed out
    pub fn monitor(&self) -> DeviceMonitor {
        DeviceMonitor {
            device: Arc::clone(&self.device),
        }
    }

    /// Split into backend parts for [`crate::Accelerator::from_parts`]
    pub fn into_parts(self) -> BackendParts {
        let kind = self.monitor().guard().kind;
        let control: Option<Box<dyn AcceleratorControl>> = match kind {
            VirtualKind::ToyNet => Some(Box::new(VirtualControl {
                device: Arc::clone(&self.device),
            })),
            VirtualKind::Loopback => None,
        };
        BackendParts {
            send: Box::new(VirtualEngine::new(Direction::Send, Arc::clone(&self.device))),
            recv: Box::new(VirtualEngine::new(Direction::Receive, Arc::clone(&self.device))),
            control,
            allocator: Box::new(HeapAllocator),
        }
    }
}

/// Inspection and fault-injection handle
#[derive(Debug, Clone)]
pub struct DeviceMonitor {
    device: SharedDevice,
}

impl DeviceMonitor {
    fn guard(&self) -> MutexGuard<'_, VirtualDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the `nth` DMA completion from now fail (1-based, both
    /// directions counted).
    pub fn fail_completion(&self, nth: u64) {
        let mut device = self.guard();
        device.fail_on_completion = Some(device.stats.completions + nth.max(1));
    }

    /// Counters so far
    pub fn stats(&self) -> DeviceStats {
        self.guard().stats
    }

    /// Buffer-ownership violations observed by the engines
    pub fn violations(&self) -> Vec<String> {
        self.guard().violations.clone()
    }

    /// True while the kernel is running
    pub fn is_started(&self) -> bool {
        self.guard().started
    }

    /// True once auto-restart has been enabled
    pub fn auto_restart(&self) -> bool {
        self.guard().auto_restart
    }

    /// Transfer starts and completions in the order they happened
    pub fn events(&self) -> Vec<TransferEvent> {
        self.guard().events.clone()
    }

    /// Forget the events recorded so far
    pub fn clear_events(&self) {
        self.guard().events.clear();
    }

    /// Output words produced but not yet received by the host
    pub fn pending_output(&self) -> usize {
        self.guard().output.len()
    }
}

#[derive(Debug)]
struct VirtualEngine {
    direction: Direction,
    device: SharedDevice,
    fingerprints: VecDeque<u64>,
}

impl VirtualEngine {
    fn new(direction: Direction, device: SharedDevice) -> Self {
        Self {
            direction,
            device,
            fingerprints: VecDeque::new(),
        }
    }
}

impl DmaEngine for VirtualEngine {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn start(&mut self, region: &mut DmaRegion, words: usize) -> Result<()> {
        let window = &region.as_words()[..words];
        self.fingerprints.push_back(fingerprint(window));
        let mut device = lock(&self.device)?;
        device.record(self.direction, TransferStage::Start, words);
        if self.direction == Direction::Send {
            device.accept(window);
        }
        Ok(())
    }

    fn complete(&mut self, region: &mut DmaRegion, words: usize) -> Result<()> {
        let direction = self.direction;
        let mut device = lock(&self.device)?;
        device.complete_one(direction)?;

        let expected = self.fingerprints.pop_front();
        if expected != Some(fingerprint(&region.as_words()[..words])) {
            return Err(device.record_violation(format!("{direction} buffer modified while in flight")));
        }

        if direction == Direction::Receive {
            if device.output.len() < words {
                return Err(ToyNetError::transfer_failed(format!(
                    "receive stalled: accelerator produced {} of {words} words",
                    device.output.len()
                )));
            }
            for (dst, src) in region.as_words_mut()[..words].iter_mut().zip(device.output.drain(..words)) {
                *dst = src;
            }
        }
        device.record(direction, TransferStage::Complete, words);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.fingerprints.clear();
        let mut device = lock(&self.device)?;
        match self.direction {
            Direction::Send => {
                device.input.clear();
                device.phase = Phase::AwaitMode;
            }
            Direction::Receive => device.output.clear(),
        }
        Ok(())
    }
}

#[derive(Debug)]
struct VirtualControl {
    device: SharedDevice,
}

impl AcceleratorControl for VirtualControl {
    fn start(&mut self) -> Result<()> {
        let mut device = lock(&self.device)?;
        device.started = true;
        device.process();
        Ok(())
    }

    fn enable_auto_restart(&mut self) -> Result<()> {
        let mut device = lock(&self.device)?;
        device.auto_restart = true;
        device.process();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toynet_chip::arch::NUM_CLASSES;
    use toynet_chip::wire::mode;

    fn toynet() -> (VirtualAccelerator, DeviceMonitor) {
        let acc = VirtualAccelerator::new(VirtualKind::ToyNet, &ProtocolConfig::default());
        let monitor = acc.monitor();
        (acc, monitor)
    }

    #[test]
    fn kernel_idle_until_started() {
        let (acc, monitor) = toynet();
        let mut device = lock(&acc.device).unwrap();
        device.accept(&[mode::INFER, 1]);
        assert_eq!(device.input.len(), 2);
        drop(device);
        assert!(!monitor.is_started());
    }

    #[test]
    fn single_shot_without_auto_restart() {
        let (acc, monitor) = toynet();
        let mut device = lock(&acc.device).unwrap();
        device.started = true;
        device.accept(&[mode::INFER, 1]);
        device.accept(&vec![0u32; SAMPLE_LEN]);
        assert_eq!(device.output.len(), NUM_CLASSES);
        assert!(!device.started);

        device.accept(&[mode::INFER, 1]);
        assert_eq!(device.input.len(), 2);
        drop(device);
        assert_eq!(monitor.stats().commands, 1);
    }

    #[test]
    fn weight_load_acks() {
        let (acc, monitor) = toynet();
        let mut device = lock(&acc.device).unwrap();
        device.started = true;
        device.auto_restart = true;
        let blob = vec![0u32; device.blob_words];
        device.accept(&[mode::WEIGHT_LOAD]);
        device.accept(&blob);
        assert_eq!(device.output.pop_front(), Some(ACK_WORD));
        drop(device);
        assert_eq!(monitor.stats().weight_loads, 1);
    }

    #[test]
    fn ack_word_follows_policy() {
        for (ack, expected) in [
            (AckPolicy::Value { value: 0xA5 }, 0xA5),
            (AckPolicy::NonZero, ACK_WORD),
            (AckPolicy::BlobLength, 61_750),
        ] {
            let protocol = ProtocolConfig {
                ack,
                ..ProtocolConfig::default()
            };
            let acc = VirtualAccelerator::new(VirtualKind::ToyNet, &protocol);
            let mut device = lock(&acc.device).unwrap();
            device.started = true;
            let blob = vec![0u32; device.blob_words];
            device.accept(&[mode::WEIGHT_LOAD]);
            device.accept(&blob);
            assert_eq!(device.output.pop_front(), Some(expected), "{ack:?}");
        }
    }

    #[test]
    fn unknown_mode_is_counted_and_dropped() {
        let (acc, monitor) = toynet();
        let mut device = lock(&acc.device).unwrap();
        device.started = true;
        device.auto_restart = true;
        device.accept(&[99]);
        assert!(device.output.is_empty());
        drop(device);
        assert_eq!(monitor.stats().unknown_modes, 1);
    }

    #[test]
    fn loopback_adds_increment() {
        let acc = VirtualAccelerator::new(VirtualKind::Loopback, &ProtocolConfig::default());
        let mut device = lock(&acc.device).unwrap();
        device.accept(&[0, 1, u32::MAX]);
        let out: Vec<u32> = device.output.drain(..).collect();
        assert_eq!(out, vec![13, 14, 12]);
    }

    #[test]
    fn injected_fault_fires_once() {
        let (acc, monitor) = toynet();
        monitor.fail_completion(2);
        let mut device = lock(&acc.device).unwrap();
        assert!(device.complete_one(Direction::Send).is_ok());
        assert!(device.complete_one(Direction::Send).is_err());
        assert!(device.complete_one(Direction::Send).is_ok());
    }

    #[test]
    fn fingerprint_detects_change() {
        assert_ne!(fingerprint(&[1, 2, 3]), fingerprint(&[1, 2, 4]));
        assert_eq!(fingerprint(&[]), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn mutation_in_flight_detected() {
        let (acc, monitor) = toynet();
        let mut engine = VirtualEngine::new(Direction::Send, Arc::clone(&acc.device));
        let mut region = DmaRegion::heap(4);
        region.as_words_mut().copy_from_slice(&[1, 2, 3, 4]);
        engine.start(&mut region, 4).unwrap();

        region.as_words_mut()[2] = 99;
        let err = engine.complete(&mut region, 4).unwrap_err();
        assert!(matches!(err, ToyNetError::HardwareError { .. }));
        assert_eq!(monitor.violations().len(), 1);
    }

    #[test]
    fn reset_discards_queued_output() {
        let acc = VirtualAccelerator::new(VirtualKind::Loopback, &ProtocolConfig::default());
        let monitor = acc.monitor();
        lock(&acc.device).unwrap().accept(&[1, 2, 3]);
        assert_eq!(monitor.pending_output(), 3);
        let mut engine = VirtualEngine::new(Direction::Receive, Arc::clone(&acc.device));
        engine.reset().unwrap();
        assert_eq!(monitor.pending_output(), 0);
    }
}
