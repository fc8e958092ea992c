//! Slot records and the fixed-capacity per-address-space slot table.

use bitflags::bitflags;
use hv_dirty_bitmap::DirtyBitmap;

use crate::error::{MemoryError, Result};

bitflags! {
    /// Per-slot flags mirrored to the hypervisor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlotFlags: u32 {
        /// Guest writes to the range fault instead of landing in host memory.
        const READ_ONLY = 1 << 0;
        /// Dirty-page logging is enabled for the range.
        const LOG_DIRTY = 1 << 1;
    }
}

/// One hypervisor-registered mapping of a guest-physical range to host memory.
///
/// `host_addr` is non-owning: the region's owner holds the real lifetime, and the slot must be
/// deregistered before the region goes away.
#[derive(Debug)]
pub struct Slot {
    id: u16,
    as_id: u16,
    pub start_addr: u64,
    pub size: u64,
    pub host_addr: u64,
    pub flags: SlotFlags,
    /// Last flags committed to the hypervisor; used to suppress no-op updates and to detect a
    /// read-only flip, which requires a two-phase boundary update.
    pub(crate) old_flags: SlotFlags,
    pub(crate) dirty_bitmap: Option<DirtyBitmap>,
}

impl Slot {
    fn empty(id: u16, as_id: u16) -> Self {
        Self {
            id,
            as_id,
            start_addr: 0,
            size: 0,
            host_addr: 0,
            flags: SlotFlags::empty(),
            old_flags: SlotFlags::empty(),
            dirty_bitmap: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn as_id(&self) -> u16 {
        self.as_id
    }

    /// Identifier sent across the boundary: slot id in the low 16 bits, address-space id above.
    pub fn boundary_id(&self) -> u32 {
        self.id as u32 | (self.as_id as u32) << 16
    }

    /// Page count of the mapped range.
    pub fn pages(&self, page_size: u64) -> u64 {
        self.size / page_size
    }

    /// Snapshot of the slot's dirty words, if logging ever allocated a bitmap.
    pub fn dirty_words(&self) -> Option<&[u64]> {
        self.dirty_bitmap.as_ref().map(|b| b.words())
    }

    /// Lazily allocate the dirty bitmap once logging is enabled. The bitmap covers
    /// `round_up(pages, 64) / 8` bytes; kernel dirty-log chunks are 64-bit-word aligned
    /// regardless of the host word size.
    pub(crate) fn ensure_bitmap(&mut self, page_size: u64) {
        if !self.flags.contains(SlotFlags::LOG_DIRTY) || self.dirty_bitmap.is_some() {
            return;
        }
        self.dirty_bitmap = Some(DirtyBitmap::new(self.pages(page_size)));
    }

    fn reset(&mut self) {
        self.start_addr = 0;
        self.size = 0;
        self.host_addr = 0;
        self.flags = SlotFlags::empty();
        self.old_flags = SlotFlags::empty();
        self.dirty_bitmap = None;
    }
}

/// Fixed-capacity arena of slots for one address space.
///
/// Occupancy is tracked by an explicit bit-set rather than a `size == 0` sentinel, so a
/// legitimately empty registration can never be confused with a free record. Capacity is the
/// hypervisor's negotiated maximum and never grows.
#[derive(Debug)]
pub struct SlotTable {
    as_id: u16,
    slots: Vec<Slot>,
    occupied: Vec<u64>,
}

impl SlotTable {
    pub(crate) fn new(as_id: u16, capacity: usize) -> Self {
        Self {
            as_id,
            slots: (0..capacity).map(|i| Slot::empty(i as u16, as_id)).collect(),
            occupied: vec![0u64; capacity.div_ceil(64)],
        }
    }

    pub fn as_id(&self) -> u16 {
        self.as_id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_occupied(&self, idx: usize) -> bool {
        self.occupied[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Claim the first free slot. Failing here means the negotiated maximum is exhausted, which
    /// the caller treats as fatal for the address-space change being applied.
    pub(crate) fn alloc(&mut self) -> Result<&mut Slot> {
        for idx in 0..self.slots.len() {
            if !self.is_occupied(idx) {
                self.occupied[idx / 64] |= 1u64 << (idx % 64);
                return Ok(&mut self.slots[idx]);
            }
        }
        Err(MemoryError::CapacityExceeded {
            capacity: self.slots.len(),
        })
    }

    /// Release a slot and drop its bitmap.
    pub(crate) fn free(&mut self, id: u16) {
        let idx = id as usize;
        debug_assert!(self.is_occupied(idx));
        self.occupied[idx / 64] &= !(1u64 << (idx % 64));
        self.slots[idx].reset();
    }

    /// Occupied slot by id.
    pub fn get(&self, id: u16) -> Option<&Slot> {
        let idx = id as usize;
        (idx < self.slots.len() && self.is_occupied(idx)).then(|| &self.slots[idx])
    }

    pub(crate) fn get_mut(&mut self, id: u16) -> Option<&mut Slot> {
        let idx = id as usize;
        (idx < self.slots.len() && self.is_occupied(idx)).then(|| &mut self.slots[idx])
    }

    /// Exact match on `(start_addr, size)`. Absence is a normal outcome: the range is
    /// deliberately untracked (e.g. it traps on every access).
    pub fn find(&self, start_addr: u64, size: u64) -> Option<&Slot> {
        self.iter_occupied()
            .find(|s| s.start_addr == start_addr && s.size == size)
    }

    pub(crate) fn find_mut(&mut self, start_addr: u64, size: u64) -> Option<&mut Slot> {
        self.iter_occupied_mut()
            .find(|s| s.start_addr == start_addr && s.size == size)
    }

    /// Occupied, non-empty slots intersecting `[start, start + size)`. `size` must be non-zero.
    pub(crate) fn overlapping_mut(
        &mut self,
        start: u64,
        size: u64,
    ) -> impl Iterator<Item = &mut Slot> {
        debug_assert!(size != 0);
        self.iter_occupied_mut().filter(move |s| {
            s.size != 0 && s.start_addr <= start + size - 1 && start <= s.start_addr + s.size - 1
        })
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| self.occupied[i / 64] & (1u64 << (i % 64)) != 0)
            .map(|(_, s)| s)
    }

    pub(crate) fn iter_occupied_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        let occupied = &self.occupied;
        self.slots
            .iter_mut()
            .enumerate()
            .filter(move |(i, _)| occupied[i / 64] & (1u64 << (i % 64)) != 0)
            .map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_fills_lowest_free_slot_first() {
        let mut table = SlotTable::new(0, 4);
        let a = table.alloc().unwrap().id();
        let b = table.alloc().unwrap().id();
        assert_eq!((a, b), (0, 1));
        table.free(0);
        assert_eq!(table.alloc().unwrap().id(), 0);
    }

    #[test]
    fn capacity_bound_is_a_typed_error() {
        let mut table = SlotTable::new(0, 32);
        for _ in 0..32 {
            table.alloc().unwrap();
        }
        assert!(matches!(
            table.alloc(),
            Err(MemoryError::CapacityExceeded { capacity: 32 })
        ));
    }

    #[test]
    fn zero_size_slot_is_distinct_from_free() {
        let mut table = SlotTable::new(0, 2);
        let slot = table.alloc().unwrap();
        // A deliberately empty registration stays occupied.
        slot.size = 0;
        let id = slot.id();
        assert!(table.get(id).is_some());
        assert_eq!(table.alloc().unwrap().id(), 1);
        table.free(id);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn overlapping_walks_every_intersecting_slot() {
        let mut table = SlotTable::new(0, 4);
        for (start, size) in [(0x0u64, 0x2000u64), (0x4000, 0x2000), (0x8000, 0x1000)] {
            let slot = table.alloc().unwrap();
            slot.start_addr = start;
            slot.size = size;
        }
        // [0x1000, 0x5000) touches the first two slots but not the third.
        let hits: Vec<u64> = table
            .overlapping_mut(0x1000, 0x4000)
            .map(|s| s.start_addr)
            .collect();
        assert_eq!(hits, vec![0x0, 0x4000]);
    }

    #[test]
    fn find_matches_exact_ranges_only() {
        let mut table = SlotTable::new(1, 4);
        let slot = table.alloc().unwrap();
        slot.start_addr = 0x1000;
        slot.size = 0x2000;
        assert!(table.find(0x1000, 0x2000).is_some());
        assert!(table.find(0x1000, 0x1000).is_none());
        assert!(table.find(0x2000, 0x2000).is_none());
        assert_eq!(table.find(0x1000, 0x2000).unwrap().boundary_id(), 1 << 16);
    }
}
