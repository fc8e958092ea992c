//! Kernel-shared dirty ring: per-vCPU circular buffer of dirty-page reports.
//!
//! The kernel appends one [`RingEntry`] per dirtied page from hardware-accelerated execution with
//! no lock shared with userspace; the only synchronization is a two-state token in each entry's
//! `flags` word:
//!
//! - the producer fills `slot`/`offset`, then release-stores [`TOKEN_DIRTY`];
//! - the consumer acquire-loads the token (making the payload fields visible), consumes the entry,
//!   then release-stores [`TOKEN_RESET`] so the producer's reset path sees the full consumption
//!   before the entry is reused.
//!
//! A partially-written entry (payload stored, token not yet `DIRTY`) is simply not observed as
//! dirty yet, which is what makes concurrent production during a drain safe. Draining the same
//! ring from two threads is *not* safe; callers serialize drains externally (the engine holds its
//! slot lock).
//!
//! A consumed (`RESET`) entry is not immediately reusable: the producer reclaims it only once the
//! reset control request has processed it ([`RingProducer::reset_sweep`] in the simulated
//! producer), exactly like the kernel's reset ioctl.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::fmt;
use std::sync::Arc;

/// Token value the producer stores once an entry's payload is complete.
pub const TOKEN_DIRTY: u32 = 1;
/// Token value the consumer stores back after collecting an entry.
pub const TOKEN_RESET: u32 = 1 << 1;

/// One dirty-page report, laid out exactly as the kernel writes it.
///
/// `slot` packs the address-space id in the upper 16 bits and the slot id in the lower 16;
/// `offset` is the page offset within that slot. The payload fields live in [`UnsafeCell`]
/// because the kernel mutates them through shared memory; they are only ever read after an
/// acquire load observes [`TOKEN_DIRTY`] and only ever written before a release store of it.
#[repr(C)]
pub struct RingEntry {
    flags: AtomicU32,
    slot: UnsafeCell<u32>,
    offset: UnsafeCell<u64>,
}

// Safety: all cross-thread access to the payload cells is ordered by the acquire/release token
// protocol above; the token word itself is atomic.
unsafe impl Sync for RingEntry {}
unsafe impl Send for RingEntry {}

impl RingEntry {
    fn zeroed() -> Self {
        Self {
            flags: AtomicU32::new(0),
            slot: UnsafeCell::new(0),
            offset: UnsafeCell::new(0),
        }
    }
}

/// Errors from ring construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The entry count must be a non-zero power of two.
    InvalidSize { size: u32 },
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::InvalidSize { size } => {
                write!(f, "dirty ring size {size} is not a non-zero power of two")
            }
        }
    }
}

impl std::error::Error for RingError {}

/// Error returned by the simulated producer when every entry is still un-consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

/// Consumer view over one vCPU's dirty ring.
///
/// The entry array is kernel-owned memory in production (mapped at vCPU creation and never
/// moved). `fetch_index` is this engine's persisted consumption cursor; it is free-running and
/// wraps the ring via `index % size`.
pub struct DirtyRing {
    entries: *const RingEntry,
    size: u32,
    fetch_index: u32,
    storage: Option<Arc<[RingEntry]>>,
}

// Safety: the entry array outlives the ring (kernel mapping contract or the owned `Arc`), and
// every access to it is synchronized by the token protocol.
unsafe impl Send for DirtyRing {}

impl DirtyRing {
    /// Wrap a kernel-mapped entry array.
    ///
    /// # Safety
    /// `entries` must point to `size` initialized [`RingEntry`] records that remain valid and
    /// pinned for the lifetime of the returned ring, and no other consumer may drain them.
    pub unsafe fn from_raw_parts(entries: *const RingEntry, size: u32) -> Result<Self, RingError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RingError::InvalidSize { size });
        }
        Ok(Self {
            entries,
            size,
            fetch_index: 0,
            storage: None,
        })
    }

    /// Allocate a ring with its own backing storage, for tests and in-process simulation.
    pub fn with_capacity(size: u32) -> Result<Self, RingError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RingError::InvalidSize { size });
        }
        let storage: Arc<[RingEntry]> = (0..size).map(|_| RingEntry::zeroed()).collect();
        Ok(Self {
            entries: storage.as_ptr(),
            size,
            fetch_index: 0,
            storage: Some(storage),
        })
    }

    /// Entry capacity (power of two).
    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Free-running consumption cursor.
    pub fn fetch_index(&self) -> u32 {
        self.fetch_index
    }

    /// A producer handle simulating the kernel side, following the kernel's store order.
    ///
    /// Only available for rings built with [`Self::with_capacity`]; the handle shares ownership
    /// of the backing storage and may be moved to another thread to exercise the token protocol
    /// concurrently.
    ///
    /// # Panics
    /// Panics for rings wrapping kernel-mapped memory, where the kernel is the producer.
    pub fn producer(&self) -> RingProducer {
        let storage = self
            .storage
            .as_ref()
            .expect("producer() requires a ring with owned storage")
            .clone();
        RingProducer {
            storage,
            produce_index: 0,
        }
    }

    /// Consume every entry currently marked dirty, in order, starting at the persisted fetch
    /// index. Returns the number of entries consumed.
    ///
    /// `visit` receives `(as_id, slot_id, page_offset)` per entry. The kernel may append new
    /// entries concurrently; they are picked up either by this drain (if their token lands before
    /// we reach them) or by the next one.
    pub fn drain(&mut self, mut visit: impl FnMut(u16, u16, u64)) -> u32 {
        let mut count = 0u32;
        loop {
            let idx = (self.fetch_index % self.size) as usize;
            // Safety: `idx < size` and the entry array is valid per the constructor contract.
            let entry = unsafe { &*self.entries.add(idx) };
            // Pairs with the producer's release store: observing DIRTY makes slot/offset visible.
            if entry.flags.load(Ordering::Acquire) != TOKEN_DIRTY {
                break;
            }
            // Safety: the producer does not touch the payload cells of an entry it has marked
            // DIRTY until we hand it back via RESET.
            let slot = unsafe { *entry.slot.get() };
            let offset = unsafe { *entry.offset.get() };
            visit((slot >> 16) as u16, (slot & 0xffff) as u16, offset);
            // Release so the kernel's reset path sees the consumption before reusing the entry.
            entry.flags.store(TOKEN_RESET, Ordering::Release);
            self.fetch_index = self.fetch_index.wrapping_add(1);
            count += 1;
        }
        count
    }
}

/// Simulated kernel producer for a [`DirtyRing`] built with [`DirtyRing::with_capacity`].
///
/// Clones share the same ring storage, e.g. one handle pushing from a "vCPU" thread and another
/// held by a fake hypervisor to service reset requests.
#[derive(Clone)]
pub struct RingProducer {
    storage: Arc<[RingEntry]>,
    produce_index: u32,
}

impl RingProducer {
    /// Publish one dirty-page report, or fail if the next entry is still awaiting consumption or
    /// reset.
    ///
    /// Mirrors the kernel's push: payload first, then a release store of the token. An entry the
    /// consumer marked [`TOKEN_RESET`] stays unavailable until [`Self::reset_sweep`] reclaims it.
    pub fn try_push(&mut self, as_id: u16, slot_id: u16, offset: u64) -> Result<(), RingFull> {
        let idx = (self.produce_index as usize) % self.storage.len();
        let entry = &self.storage[idx];
        if entry.flags.load(Ordering::Acquire) != 0 {
            return Err(RingFull);
        }
        // Safety: the consumer does not read the payload cells until it observes the DIRTY token
        // stored below.
        unsafe {
            *entry.slot.get() = (as_id as u32) << 16 | slot_id as u32;
            *entry.offset.get() = offset;
        }
        entry.flags.store(TOKEN_DIRTY, Ordering::Release);
        self.produce_index = self.produce_index.wrapping_add(1);
        Ok(())
    }

    /// Service a reset request: reclaim every consumed entry, returning how many were reclaimed.
    ///
    /// This is the simulated counterpart of the kernel's reset-dirty-rings control request; the
    /// acquire load of each token pairs with the consumer's release store so the reclaimed
    /// entries' consumption is fully visible.
    pub fn reset_sweep(&self) -> u64 {
        let mut count = 0u64;
        for entry in self.storage.iter() {
            if entry.flags.load(Ordering::Acquire) == TOKEN_RESET {
                entry.flags.store(0, Ordering::Release);
                count += 1;
            }
        }
        count
    }
}
