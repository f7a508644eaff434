// SPDX-License-Identifier: AGPL-3.0-only

//! DMA buffer arena
//!
//! Buffers handed to a DMA engine live in a [`DmaPool`]. Each slot carries
//! an in-flight flag that is set by [`crate::TransferChannel::transfer`] and
//! cleared only when the matching `wait()` returns. While the flag is set,
//! every host-side access to the slot (read, write, resubmit, release) is
//! rejected with [`ToyNetError::BufferInFlight`] and the memory is left
//! untouched.

use crate::channel::Direction;
use crate::error::{Result, ToyNetError};
use crate::mmio::MappedRegion;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use toynet_chip::wire::WORD_BYTES;

/// Memory a DMA engine can read from or write into, in 32-bit words
#[derive(Debug)]
pub struct DmaRegion {
    backing: Backing,
    words: usize,
}

#[derive(Debug)]
enum Backing {
    /// Ordinary heap memory (software backends)
    Heap(Box<[u32]>),
    /// Leased sub-range of a physically contiguous mapping
    Mapped { arena: Arc<MappedArena>, offset: usize },
}

impl DmaRegion {
    /// Zeroed heap region of `words` words.
    pub fn heap(words: usize) -> Self {
        Self {
            backing: Backing::Heap(vec![0u32; words].into_boxed_slice()),
            words,
        }
    }

    /// Capacity in words
    pub const fn len(&self) -> usize {
        self.words
    }

    /// True for a zero-word region
    pub const fn is_empty(&self) -> bool {
        self.words == 0
    }

    /// Bus address the DMA engine must be programmed with, if any
    pub fn device_addr(&self) -> Option<u64> {
        match &self.backing {
            Backing::Heap(_) => None,
            Backing::Mapped { arena, offset } => Some(arena.phys_base + *offset as u64),
        }
    }

    /// Word view
    pub fn as_words(&self) -> &[u32] {
        match &self.backing {
            Backing::Heap(words) => words,
            // SAFETY: lease() placed offset..offset+words*4 inside the mapping,
            // aligned and disjoint from every other live lease; the Arc keeps
            // the mapping alive.
            Backing::Mapped { arena, offset } => unsafe {
                std::slice::from_raw_parts(arena.map.as_ptr().add(*offset).cast::<u32>(), self.words)
            },
        }
    }

    /// Mutable word view
    pub fn as_words_mut(&mut self) -> &mut [u32] {
        match &mut self.backing {
            Backing::Heap(words) => words,
            // SAFETY: as in as_words(); &mut self guarantees this region has
            // no other live view.
            Backing::Mapped { arena, offset } => unsafe {
                std::slice::from_raw_parts_mut(arena.map.as_ptr().add(*offset).cast::<u32>(), self.words)
            },
        }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if let Backing::Mapped { arena, offset } = &self.backing {
            arena.give_back(*offset);
        }
    }
}

/// Range allocator over one physically contiguous mapping
///
/// Every live [`DmaRegion`] holds a lease on a byte range. Dropping the
/// region returns the range, so long-lived regions never pin memory that
/// short-lived ones released. Placement is first fit.
#[derive(Debug)]
pub struct MappedArena {
    map: MappedRegion,
    phys_base: u64,
    align: usize,
    /// Leased ranges, start offset → end offset (bytes)
    leases: Mutex<BTreeMap<usize, usize>>,
}

impl MappedArena {
    /// Arena over `map`, whose first byte sits at bus address `phys_base`.
    /// Regions start on `align`-byte boundaries.
    pub fn new(map: MappedRegion, phys_base: u64, align: usize) -> Arc<Self> {
        Arc::new(Self {
            map,
            phys_base,
            align: align.max(WORD_BYTES),
            leases: Mutex::new(BTreeMap::new()),
        })
    }

    /// Lease a zeroed region of `words` words.
    ///
    /// # Errors
    ///
    /// Returns [`ToyNetError::BufferExhausted`] if no gap is large enough.
    pub fn lease(self: &Arc<Self>, words: usize) -> Result<DmaRegion> {
        // Zero-word regions still occupy a word so every lease has a unique start
        let bytes = words.max(1) * WORD_BYTES;
        let offset = {
            let mut leases = self.leases();
            let offset = self.find_gap(&leases, bytes).ok_or_else(|| ToyNetError::BufferExhausted {
                requested: bytes,
                free: self.map.size() - leased(&leases),
            })?;
            leases.insert(offset, offset + bytes);
            offset
        };
        let mut region = DmaRegion {
            backing: Backing::Mapped {
                arena: Arc::clone(self),
                offset,
            },
            words,
        };
        region.as_words_mut().fill(0);
        Ok(region)
    }

    /// Bytes currently leased
    pub fn leased_bytes(&self) -> usize {
        leased(&self.leases())
    }

    /// Size of the mapping in bytes
    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Path of the underlying mapping
    pub fn label(&self) -> &str {
        self.map.label()
    }

    fn find_gap(&self, leases: &BTreeMap<usize, usize>, bytes: usize) -> Option<usize> {
        let mut cursor: usize = 0;
        for (&start, &end) in leases {
            let candidate = cursor.next_multiple_of(self.align);
            if candidate + bytes <= start {
                return Some(candidate);
            }
            cursor = end;
        }
        let candidate = cursor.next_multiple_of(self.align);
        (candidate + bytes <= self.map.size()).then_some(candidate)
    }

    fn give_back(&self, offset: usize) {
        if self.leases().remove(&offset).is_none() {
            tracing::warn!("{}: region at {offset:#x} returned twice", self.map.label());
        }
    }

    fn leases(&self) -> MutexGuard<'_, BTreeMap<usize, usize>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn leased(leases: &BTreeMap<usize, usize>) -> usize {
    leases.iter().map(|(start, end)| end - start).sum()
}

/// Source of DMA-capable memory for one backend
pub trait DmaAllocator: Debug + Send {
    /// Allocate a zero-initialised region of `words` words.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot provide that much memory.
    fn allocate(&mut self, words: usize) -> Result<DmaRegion>;
}

/// Heap allocator used by the software backends
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl DmaAllocator for HeapAllocator {
    fn allocate(&mut self, words: usize) -> Result<DmaRegion> {
        Ok(DmaRegion::heap(words))
    }
}

/// Handle to one slot of a [`DmaPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Slot index
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    InFlight(Direction),
}

#[derive(Debug)]
struct Slot {
    region: DmaRegion,
    state: SlotState,
}

/// Arena of fixed-capacity DMA buffers with per-slot in-flight flags
#[derive(Debug, Default)]
pub struct DmaPool {
    slots: Vec<Option<Slot>>,
}

impl DmaPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `region` and return its slot.
    pub fn insert(&mut self, region: DmaRegion) -> SlotId {
        let slot = Slot {
            region,
            state: SlotState::Idle,
        };
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            self.slots[free] = Some(slot);
            SlotId(free)
        } else {
            self.slots.push(Some(slot));
            SlotId(self.slots.len() - 1)
        }
    }

    /// Remove a slot and hand back its memory.
    ///
    /// # Errors
    ///
    /// Returns error if the slot is unknown or still in flight.
    pub fn release(&mut self, id: SlotId) -> Result<DmaRegion> {
        self.idle_slot(id)?;
        self.slots[id.0]
            .take()
            .map(|slot| slot.region)
            .ok_or(ToyNetError::InvalidSlot { slot: id.0 })
    }

    /// Capacity of a slot in words
    ///
    /// # Errors
    ///
    /// Returns error if the slot is unknown.
    pub fn capacity(&self, id: SlotId) -> Result<usize> {
        self.slot(id).map(|slot| slot.region.len())
    }

    /// True while a transfer over the slot is outstanding
    pub fn is_in_flight(&self, id: SlotId) -> bool {
        self.slot(id)
            .is_ok_and(|slot| matches!(slot.state, SlotState::InFlight(_)))
    }

    /// Number of slots currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| matches!(slot.state, SlotState::InFlight(_)))
            .count()
    }

    /// Read access to an idle slot.
    ///
    /// # Errors
    ///
    /// Returns [`ToyNetError::BufferInFlight`] while a transfer is outstanding.
    pub fn words(&self, id: SlotId) -> Result<&[u32]> {
        Ok(self.idle_slot(id)?.region.as_words())
    }

    /// Write access to an idle slot.
    ///
    /// # Errors
    ///
    /// Returns [`ToyNetError::BufferInFlight`] while a transfer is outstanding.
    pub fn words_mut(&mut self, id: SlotId) -> Result<&mut [u32]> {
        self.idle_slot(id)?;
        self.slots[id.0]
            .as_mut()
            .map(|slot| slot.region.as_words_mut())
            .ok_or(ToyNetError::InvalidSlot { slot: id.0 })
    }

    /// Copy `words` into the start of an idle slot.
    ///
    /// # Errors
    ///
    /// Returns error if the slot is in flight or too small.
    pub fn write_words(&mut self, id: SlotId, words: &[u32]) -> Result<()> {
        let dst = self.words_mut(id)?;
        let capacity = dst.len();
        dst.get_mut(..words.len())
            .ok_or_else(|| {
                ToyNetError::invalid_state(format!(
                    "slot {} holds {capacity} words, cannot write {}",
                    id.0,
                    words.len()
                ))
            })?
            .copy_from_slice(words);
        Ok(())
    }

    /// Copy `values` into the start of an idle slot as IEEE-754 words.
    ///
    /// # Errors
    ///
    /// Returns error if the slot is in flight or too small.
    pub fn write_f32(&mut self, id: SlotId, values: &[f32]) -> Result<()> {
        let dst = self.words_mut(id)?;
        if values.len() > dst.len() {
            return Err(ToyNetError::invalid_state(format!(
                "slot {} holds {} words, cannot write {}",
                id.0,
                dst.len(),
                values.len()
            )));
        }
        for (word, value) in dst.iter_mut().zip(values) {
            *word = value.to_bits();
        }
        Ok(())
    }

    /// Read the first `len` words of an idle slot as floats.
    ///
    /// # Errors
    ///
    /// Returns error if the slot is in flight or shorter than `len`.
    pub fn read_f32(&self, id: SlotId, len: usize) -> Result<Vec<f32>> {
        let src = self.words(id)?;
        src.get(..len)
            .map(|words| words.iter().copied().map(f32::from_bits).collect())
            .ok_or_else(|| {
                ToyNetError::invalid_state(format!(
                    "slot {} holds {} words, cannot read {len}",
                    id.0,
                    src.len()
                ))
            })
    }

    /// Mark a slot in flight and hand its region to a DMA engine.
    pub(crate) fn begin_transfer(
        &mut self,
        id: SlotId,
        direction: Direction,
        words: usize,
    ) -> Result<&mut DmaRegion> {
        self.idle_slot(id)?;
        let slot = self.slots[id.0]
            .as_mut()
            .ok_or(ToyNetError::InvalidSlot { slot: id.0 })?;
        if words == 0 || words > slot.region.len() {
            return Err(ToyNetError::invalid_state(format!(
                "cannot transfer {words} words over slot {} of {} words",
                id.0,
                slot.region.len()
            )));
        }
        slot.state = SlotState::InFlight(direction);
        Ok(&mut slot.region)
    }

    /// Region of an in-flight slot, for the engine completing it.
    pub(crate) fn in_flight_region(&mut self, id: SlotId) -> Result<&mut DmaRegion> {
        match self.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(slot) if matches!(slot.state, SlotState::InFlight(_)) => Ok(&mut slot.region),
            Some(_) => Err(ToyNetError::invalid_state(format!(
                "slot {} has no outstanding transfer",
                id.0
            ))),
            None => Err(ToyNetError::InvalidSlot { slot: id.0 }),
        }
    }

    /// Clear the in-flight flag after the matching wait returned.
    pub(crate) fn end_transfer(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.get_mut(id.0).and_then(Option::as_mut) {
            slot.state = SlotState::Idle;
        }
    }

    fn slot(&self, id: SlotId) -> Result<&Slot> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(ToyNetError::InvalidSlot { slot: id.0 })
    }

    fn idle_slot(&self, id: SlotId) -> Result<&Slot> {
        let slot = self.slot(id)?;
        match slot.state {
            SlotState::Idle => Ok(slot),
            SlotState::InFlight(direction) => {
                tracing::warn!("Access to slot {} while {direction} transfer in flight", id.0);
                Err(ToyNetError::BufferInFlight { slot: id.0 })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_floats() {
        let mut pool = DmaPool::new();
        let id = pool.insert(DmaRegion::heap(4));
        pool.write_f32(id, &[1.0, -2.5]).unwrap();
        assert_eq!(pool.read_f32(id, 2).unwrap(), vec![1.0, -2.5]);
        assert_eq!(pool.words(id).unwrap()[2], 0);
    }

    #[test]
    fn in_flight_slot_rejects_host_access() {
        let mut pool = DmaPool::new();
        let id = pool.insert(DmaRegion::heap(4));
        pool.begin_transfer(id, Direction::Send, 4).unwrap();

        assert!(pool.is_in_flight(id));
        assert!(matches!(pool.words(id), Err(ToyNetError::BufferInFlight { slot: 0 })));
        assert!(matches!(pool.write_f32(id, &[1.0]), Err(ToyNetError::BufferInFlight { .. })));
        assert!(matches!(pool.release(id), Err(ToyNetError::BufferInFlight { .. })));
        assert!(matches!(
            pool.begin_transfer(id, Direction::Send, 4),
            Err(ToyNetError::BufferInFlight { .. })
        ));

        pool.end_transfer(id);
        assert!(!pool.is_in_flight(id));
        assert!(pool.words(id).is_ok());
    }

    #[test]
    fn oversized_write_rejected() {
        let mut pool = DmaPool::new();
        let id = pool.insert(DmaRegion::heap(2));
        assert!(pool.write_words(id, &[1, 2, 3]).is_err());
        assert!(pool.read_f32(id, 3).is_err());
    }

    #[test]
    fn released_slot_is_reused() {
        let mut pool = DmaPool::new();
        let a = pool.insert(DmaRegion::heap(1));
        let _b = pool.insert(DmaRegion::heap(1));
        pool.release(a).unwrap();
        assert!(matches!(pool.capacity(a), Err(ToyNetError::InvalidSlot { .. })));
        let c = pool.insert(DmaRegion::heap(8));
        assert_eq!(c.index(), a.index());
        assert_eq!(pool.capacity(c).unwrap(), 8);
    }

    #[test]
    fn zero_length_transfer_rejected() {
        let mut pool = DmaPool::new();
        let id = pool.insert(DmaRegion::heap(2));
        assert!(pool.begin_transfer(id, Direction::Receive, 0).is_err());
        assert!(pool.begin_transfer(id, Direction::Receive, 3).is_err());
        assert!(!pool.is_in_flight(id));
    }
}
