//! The memory engine: region events in, merged dirty bitmaps out.
//!
//! One engine instance owns the slot tables of every address space of a VM. A single coarse lock
//! serializes all slot mutation and all bitmap access; dirty-bit publication correctness depends
//! on a flush never interleaving with a concurrent region add/remove. The only path outside that
//! lock is the kernel's producer side of the dirty rings, which is ordered purely by the ring's
//! token protocol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use hv_dirty_bitmap::ClearWindow;
use hv_dirty_ring::DirtyRing;

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::hv::{DirtyRateLimiter, Hypervisor, SlotUpdate, VcpuGang, ENOENT};
use crate::mapper::{align_region, chunks};
use crate::reaper::Reaper;
use crate::slot::{Slot, SlotFlags, SlotTable};

/// A region-add event from the address-space collaborator.
#[derive(Debug, Clone, Copy)]
pub struct RegionAdd {
    pub addr: u64,
    pub size: u64,
    /// Host address of the backing memory; non-owning, the region's owner holds its lifetime.
    pub host_addr: u64,
    pub read_only: bool,
    pub log_dirty: bool,
}

/// The event stream consumed from the address-space collaborator.
#[derive(Debug, Clone, Copy)]
pub enum RegionEvent {
    Add(RegionAdd),
    Del { addr: u64, size: u64 },
    LogStart { addr: u64, size: u64 },
    LogStop { addr: u64, size: u64 },
    FlagsChanged { addr: u64, size: u64, read_only: bool, log_dirty: bool },
}

/// Final dirty state of a slot handed back by [`MemoryEngine::region_del`], so the dirty
/// information that existed only in the torn-down slot's bitmap is not lost.
#[derive(Debug, Clone)]
pub struct DirtySnapshot {
    pub start_addr: u64,
    pub pages: u64,
    pub words: Vec<u64>,
}

/// Ring-drain diagnostics.
#[derive(Debug, Clone, Default)]
pub struct DrainStats {
    pub pages_collected: u64,
    pub ring_resets: u64,
    pub per_vcpu: HashMap<u32, u64>,
}

pub(crate) struct EngineShared {
    pub(crate) config: MemoryConfig,
    pub(crate) hv: Box<dyn Hypervisor>,
    pub(crate) vcpus: Box<dyn VcpuGang>,
    pub(crate) limiter: Box<dyn DirtyRateLimiter>,
    pub(crate) state: Mutex<EngineState>,
}

#[derive(Default)]
pub(crate) struct EngineState {
    spaces: Vec<SlotTable>,
    rings: Vec<(u32, DirtyRing)>,
    stats: DrainStats,
}

/// The memory-virtualization engine of one VM.
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
    reaper: Option<Reaper>,
}

impl MemoryEngine {
    /// Build an engine. In ring mode this also spawns the background reaper, which runs until
    /// the engine is dropped.
    pub fn new(
        config: MemoryConfig,
        hv: Box<dyn Hypervisor>,
        vcpus: Box<dyn VcpuGang>,
        limiter: Box<dyn DirtyRateLimiter>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(EngineShared {
            config,
            hv,
            vcpus,
            limiter,
            state: Mutex::new(EngineState::default()),
        });
        let reaper = shared
            .config
            .ring_mode()
            .then(|| Reaper::spawn(shared.clone()));
        Ok(Self { shared, reaper })
    }

    /// Create a new address space (main RAM is conventionally 0) and return its id.
    pub fn add_address_space(&self) -> u16 {
        let mut state = self.lock();
        let as_id = state.spaces.len() as u16;
        state
            .spaces
            .push(SlotTable::new(as_id, self.shared.config.slot_capacity));
        as_id
    }

    /// Register a vCPU's dirty ring with the engine. The ring's capacity must match the
    /// configured `dirty_ring_size`.
    pub fn attach_ring(&self, vcpu_id: u32, ring: DirtyRing) -> Result<()> {
        if !self.shared.config.ring_mode() {
            return Err(MemoryError::DirtyRingDisabled);
        }
        if ring.capacity() != self.shared.config.dirty_ring_size {
            return Err(MemoryError::InvalidConfig(format!(
                "ring capacity {} does not match configured dirty_ring_size {}",
                ring.capacity(),
                self.shared.config.dirty_ring_size
            )));
        }
        self.lock().rings.push((vcpu_id, ring));
        Ok(())
    }

    /// Dispatch one address-space event. `Del` discards the final dirty snapshots; callers that
    /// need them use [`Self::region_del`] directly.
    pub fn handle_region_event(&self, as_id: u16, event: RegionEvent) -> Result<()> {
        match event {
            RegionEvent::Add(region) => self.region_add(as_id, &region),
            RegionEvent::Del { addr, size } => self.region_del(as_id, addr, size).map(|_| ()),
            RegionEvent::LogStart { addr, size } => {
                self.apply_flags(as_id, addr, size, |f| f | SlotFlags::LOG_DIRTY)
            }
            RegionEvent::LogStop { addr, size } => {
                self.apply_flags(as_id, addr, size, |f| f - SlotFlags::LOG_DIRTY)
            }
            RegionEvent::FlagsChanged { addr, size, read_only, log_dirty } => {
                self.apply_flags(as_id, addr, size, move |_| flags_for(read_only, log_dirty))
            }
        }
    }

    /// Map a region into one slot per chunk and push each to the hypervisor.
    ///
    /// A registration failure leaves the just-allocated slot freed locally but means the
    /// engine's and the hypervisor's views have diverged; the returned error is fatal for the
    /// VM.
    pub fn region_add(&self, as_id: u16, region: &RegionAdd) -> Result<()> {
        let page = self.shared.config.page_size;
        let Some((start, size)) = align_region(region.addr, region.size, page) else {
            return Ok(());
        };
        let mut host_addr = region.host_addr + (start - region.addr);
        let flags = flags_for(region.read_only, region.log_dirty);

        let mut state = self.lock();
        let table = space_mut(&mut state, as_id)?;
        for (chunk_addr, chunk_size) in chunks(start, size, self.shared.config.max_slot_size) {
            let slot = table.alloc()?;
            slot.start_addr = chunk_addr;
            slot.size = chunk_size;
            slot.host_addr = host_addr;
            slot.flags = flags;
            slot.ensure_bitmap(page);
            let id = slot.id();
            tracing::debug!(
                slot = id,
                as_id,
                start = format_args!("{chunk_addr:#x}"),
                size = format_args!("{chunk_size:#x}"),
                "register slot"
            );
            if let Err(err) = commit_slot(&*self.shared.hv, slot, true) {
                table.free(id);
                return Err(err);
            }
            host_addr += chunk_size;
        }
        Ok(())
    }

    /// Tear down the slots covering a region, collecting their final dirty state first.
    ///
    /// For each logging slot the engine does a best-effort last collection pass (ring drain in
    /// ring mode, bitmap pull otherwise) and returns the merged bitmap. Dirty bits can still
    /// land in hardware buffers after the collection but before the slot is removed; that
    /// window is inherent to the kernel interface and deliberately left open.
    pub fn region_del(&self, as_id: u16, addr: u64, size: u64) -> Result<Vec<DirtySnapshot>> {
        let page = self.shared.config.page_size;
        let max = self.shared.config.max_slot_size;
        let Some((start, size)) = align_region(addr, size, page) else {
            return Ok(Vec::new());
        };

        let mut state = self.lock();
        let any_logging = {
            let table = space_mut(&mut state, as_id)?;
            chunks(start, size, max)
                .map_while(|(a, l)| table.find(a, l))
                .any(|s| s.flags.contains(SlotFlags::LOG_DIRTY))
        };
        if any_logging && self.shared.config.ring_mode() {
            drain_ring_set(
                &*self.shared.hv,
                &mut state,
                None,
                self.shared.config.page_size,
            )?;
        }

        let mut snapshots = Vec::new();
        let table = space_mut(&mut state, as_id)?;
        for (chunk_addr, chunk_size) in chunks(start, size, max) {
            let Some(slot) = table.find_mut(chunk_addr, chunk_size) else {
                // No slot for this chunk: the rest of the range is untracked.
                break;
            };
            if slot.flags.contains(SlotFlags::LOG_DIRTY) {
                if !self.shared.config.ring_mode() {
                    sync_slot(&*self.shared.hv, slot);
                }
                if let Some(bitmap) = &slot.dirty_bitmap {
                    snapshots.push(DirtySnapshot {
                        start_addr: slot.start_addr,
                        pages: bitmap.pages(),
                        words: bitmap.words().to_vec(),
                    });
                }
            }
            let id = slot.id();
            slot.size = 0;
            slot.flags = SlotFlags::empty();
            slot.dirty_bitmap = None;
            tracing::debug!(slot = id, as_id, "deregister slot");
            let committed = commit_slot(&*self.shared.hv, slot, false);
            table.free(id);
            committed?;
        }
        Ok(snapshots)
    }

    /// Flag-only update (log start/stop, read-only toggle) for the slots covering a region.
    fn apply_flags(
        &self,
        as_id: u16,
        addr: u64,
        size: u64,
        f: impl Fn(SlotFlags) -> SlotFlags,
    ) -> Result<()> {
        let page = self.shared.config.page_size;
        let Some((start, size)) = align_region(addr, size, page) else {
            return Ok(());
        };
        let mut state = self.lock();
        let table = space_mut(&mut state, as_id)?;
        for (chunk_addr, chunk_size) in chunks(start, size, self.shared.config.max_slot_size) {
            let Some(slot) = table.find_mut(chunk_addr, chunk_size) else {
                break;
            };
            slot.flags = f(slot.flags);
            slot.ensure_bitmap(page);
            // No boundary call when nothing effectively changed.
            if slot.flags != slot.old_flags {
                commit_slot(&*self.shared.hv, slot, false)?;
            }
        }
        Ok(())
    }

    /// Pull the kernel's dirty bitmap for a region and merge it into the per-slot bitmaps
    /// (bitmap-mode collection).
    pub fn sync_dirty(&self, as_id: u16, addr: u64, size: u64) -> Result<()> {
        let page = self.shared.config.page_size;
        let Some((start, size)) = align_region(addr, size, page) else {
            return Ok(());
        };
        let mut state = self.lock();
        let table = space_mut(&mut state, as_id)?;
        for (chunk_addr, chunk_size) in chunks(start, size, self.shared.config.max_slot_size) {
            let Some(slot) = table.find_mut(chunk_addr, chunk_size) else {
                break;
            };
            sync_slot(&*self.shared.hv, slot);
        }
        Ok(())
    }

    /// Clear dirty state for a range: kernel first, local bitmap second.
    ///
    /// No-op unless manual dirty-log protection was negotiated (without it the kernel's own
    /// get-dirty-log call clears state). Walks every occupied slot overlapping the range. The
    /// local bitmap is only cleared after the boundary call succeeds: publishing the clear
    /// locally first would let a concurrent reader believe pages are clean that the kernel has
    /// not yet re-protected.
    pub fn clear_dirty(&self, as_id: u16, addr: u64, size: u64) -> Result<()> {
        if !self.shared.config.manual_dirty_log_protect || size == 0 {
            return Ok(());
        }
        let page = self.shared.config.page_size;
        let hv = &*self.shared.hv;
        let mut state = self.lock();
        let table = space_mut(&mut state, as_id)?;
        for slot in table.overlapping_mut(addr, size) {
            // Intersection of the caller range with this slot, as pages within the slot.
            let (offset, count) = if addr >= slot.start_addr {
                let offset = addr - slot.start_addr;
                (offset, (slot.size - offset).min(size))
            } else {
                (0, slot.size.min(size - (slot.start_addr - addr)))
            };
            let start_page = offset / page;
            let count_pages = count / page;
            if count_pages == 0 {
                continue;
            }
            let slot_pages = slot.pages(page);
            let boundary_id = slot.boundary_id();
            let Some(bitmap) = slot.dirty_bitmap.as_mut() else {
                // Clear before any sync: nothing locally to reconcile against.
                continue;
            };
            let window = ClearWindow::compute(start_page, count_pages, slot_pages)
                .expect("intersection is clamped to the slot");
            let ret = if window.is_fast_path() {
                // The window equals the caller range, so hand the kernel a slice of the live
                // bitmap. The kernel may concurrently dirty further pages in its own bitmap;
                // that race is tolerated by the interface, not fixable from here.
                let first = window.first_word();
                let words = &bitmap.words()[first..first + window.word_len()];
                hv.clear_dirty_log(boundary_id, window.first_page, window.num_pages as u32, words)
            } else {
                let tmp =
                    bitmap.copy_window(window.first_page, window.num_pages, window.start_delta);
                hv.clear_dirty_log(boundary_id, window.first_page, window.num_pages as u32, &tmp)
            };
            match ret {
                Ok(()) | Err(ENOENT) => {
                    bitmap
                        .clear_range(start_page, count_pages)
                        .expect("intersection is clamped to the slot");
                }
                Err(errno) => {
                    tracing::error!(
                        slot = boundary_id,
                        first_page = window.first_page,
                        num_pages = window.num_pages,
                        errno,
                        "clear_dirty_log failed"
                    );
                    return Err(MemoryError::BoundaryCallFailed {
                        op: "clear_dirty_log",
                        errno,
                    });
                }
            }
        }
        Ok(())
    }

    /// Ring-mode global sync: flush, drain every ring, hand each logging slot's merged bitmap to
    /// `visit`, then reset the local copies (the ring reset already re-armed the kernel path;
    /// bitmap mode must not do this, its kernel read clears state itself).
    ///
    /// Returns the number of ring entries collected by the flush.
    pub fn global_sync(
        &self,
        as_id: u16,
        mut visit: impl FnMut(u64, u64, &[u64]),
    ) -> Result<u64> {
        if !self.shared.config.ring_mode() {
            return Err(MemoryError::DirtyRingDisabled);
        }
        // Flush: kick every vCPU out once so hardware-buffered dirty state reaches the rings,
        // then drain under the slot lock so no reader sees bits the kernel has not re-protected.
        self.shared.vcpus.kick_all();
        let mut state = self.lock();
        let total = drain_ring_set(
            &*self.shared.hv,
            &mut state,
            None,
            self.shared.config.page_size,
        )?;
        let table = space_mut(&mut state, as_id)?;
        for slot in table.iter_occupied_mut() {
            if !slot.flags.contains(SlotFlags::LOG_DIRTY) {
                continue;
            }
            let start_addr = slot.start_addr;
            if let Some(bitmap) = slot.dirty_bitmap.as_mut() {
                visit(start_addr, bitmap.pages(), bitmap.words());
                bitmap.clear_all();
            }
        }
        Ok(total)
    }

    /// Urgency path for a vCPU whose ring has no free entries: it cannot resume until its ring
    /// is drained. Drains only that ring while the rate limiter is in service (reaping all
    /// vCPUs would defeat the limiter's per-vCPU throttling), otherwise all rings.
    pub fn ring_full(&self, vcpu_id: u32) -> Result<u64> {
        if !self.shared.config.ring_mode() {
            return Err(MemoryError::DirtyRingDisabled);
        }
        let only = self.shared.limiter.in_service().then_some(vcpu_id);
        let mut state = self.lock();
        drain_ring_set(&*self.shared.hv, &mut state, only, self.shared.config.page_size)
    }

    /// Snapshot of the dirty words of the slot exactly matching the (page-aligned) range.
    ///
    /// Requires a registered slot; `None` means the slot exists but logging never allocated a
    /// bitmap for it.
    pub fn read_bitmap(&self, as_id: u16, addr: u64, size: u64) -> Result<Option<Vec<u64>>> {
        let page = self.shared.config.page_size;
        let not_found = MemoryError::SlotNotFound { addr, size };
        let Some((start, size)) = align_region(addr, size, page) else {
            return Err(not_found);
        };
        let mut state = self.lock();
        let table = space_mut(&mut state, as_id)?;
        let slot = table.find(start, size).ok_or(not_found)?;
        Ok(slot.dirty_words().map(<[u64]>::to_vec))
    }

    pub fn drain_stats(&self) -> DrainStats {
        self.lock().stats.clone()
    }

    /// Completed reaper cycles, for diagnostics. `None` in bitmap mode.
    pub fn reaper_iterations(&self) -> Option<u64> {
        self.reaper.as_ref().map(Reaper::iterations)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.shared.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.shared.state.lock().expect("slot lock poisoned")
    }
}

fn flags_for(read_only: bool, log_dirty: bool) -> SlotFlags {
    let mut flags = SlotFlags::empty();
    if read_only {
        flags |= SlotFlags::READ_ONLY;
    }
    if log_dirty {
        flags |= SlotFlags::LOG_DIRTY;
    }
    flags
}

fn space_mut(state: &mut EngineState, as_id: u16) -> Result<&mut SlotTable> {
    state
        .spaces
        .get_mut(as_id as usize)
        .ok_or(MemoryError::UnknownAddressSpace { as_id })
}

/// Push a slot's current state across the boundary.
///
/// When an existing slot flips its read-only protection, the hypervisor requires the slot to be
/// shrunk to zero first and re-registered with the new flags, so this issues two calls in that
/// case. `old_flags` is only advanced after the final call succeeds.
fn commit_slot(hv: &dyn Hypervisor, slot: &mut Slot, new: bool) -> Result<()> {
    let update = SlotUpdate {
        slot: slot.boundary_id(),
        guest_phys_addr: slot.start_addr,
        memory_size: slot.size,
        userspace_addr: slot.host_addr,
        flags: slot.flags,
    };
    if slot.size != 0 && !new && (slot.flags ^ slot.old_flags).contains(SlotFlags::READ_ONLY) {
        let zeroed = SlotUpdate {
            memory_size: 0,
            ..update
        };
        hv.set_memory_region(&zeroed)
            .map_err(|errno| MemoryError::BoundaryCallFailed {
                op: "set_memory_region",
                errno,
            })?;
    }
    hv.set_memory_region(&update)
        .map_err(|errno| MemoryError::BoundaryCallFailed {
            op: "set_memory_region",
            errno,
        })?;
    slot.old_flags = slot.flags;
    Ok(())
}

/// Bitmap-mode pull: merge the kernel's dirty bitmap for one slot into the local one.
///
/// "Not found" is the normal state of a slot that was never logged; any other failure degrades
/// tracking to "may under-report" (consumers re-scan), logged once per process to avoid a log
/// storm when a transient kernel state repeats across thousands of slots.
fn sync_slot(hv: &dyn Hypervisor, slot: &mut Slot) {
    let boundary_id = slot.boundary_id();
    let Some(bitmap) = slot.dirty_bitmap.as_mut() else {
        return;
    };
    let mut scratch = vec![0u64; bitmap.words().len()];
    match hv.get_dirty_log(boundary_id, &mut scratch) {
        Ok(()) => bitmap.or_words(&scratch),
        Err(errno) if errno == ENOENT => {}
        Err(errno) => {
            static WARN_ONCE: Once = Once::new();
            WARN_ONCE.call_once(|| {
                tracing::warn!(
                    slot = boundary_id,
                    errno,
                    "get_dirty_log failed; dirty tracking may under-report"
                );
            });
        }
    }
}

/// Drain the rings (all of them, or just `only`'s) into the per-slot bitmaps, then issue one
/// ring-reset boundary call if anything was collected.
///
/// Must run with the slot lock held: the bits are marked across many slots, and they must not be
/// published to other threads before the reset call re-protects the pages.
pub(crate) fn drain_ring_set(
    hv: &dyn Hypervisor,
    state: &mut EngineState,
    only: Option<u32>,
    page_size: u64,
) -> Result<u64> {
    let EngineState { spaces, rings, stats } = state;
    let mut total = 0u64;
    for (vcpu, ring) in rings.iter_mut() {
        if only.is_some_and(|v| v != *vcpu) {
            continue;
        }
        let n = u64::from(ring.drain(|as_id, slot_id, offset| {
            mark_page(spaces, as_id, slot_id, offset, page_size)
        }));
        if n > 0 {
            tracing::trace!(vcpu = *vcpu, pages = n, "drained dirty ring");
            *stats.per_vcpu.entry(*vcpu).or_default() += n;
        }
        total += n;
    }
    if total > 0 {
        let acked = hv
            .reset_dirty_rings()
            .map_err(|errno| MemoryError::BoundaryCallFailed {
                op: "reset_dirty_rings",
                errno,
            })?;
        // A mismatch means the kernel and this engine disagree about how many entries were
        // consumed; dirty tracking is already silently corrupt at that point.
        assert_eq!(acked, total, "dirty ring reset count mismatch");
        stats.ring_resets += 1;
        stats.pages_collected += total;
    }
    Ok(total)
}

/// Mark one ring-reported page in its slot's bitmap. Stale reports (freed slot, out-of-range
/// offset, unknown address space) are dropped; entries can legitimately outlive a region_del.
fn mark_page(spaces: &mut [SlotTable], as_id: u16, slot_id: u16, offset: u64, page_size: u64) {
    let Some(table) = spaces.get_mut(as_id as usize) else {
        return;
    };
    let Some(slot) = table.get_mut(slot_id) else {
        return;
    };
    if offset >= slot.pages(page_size) {
        return;
    }
    if let Some(bitmap) = slot.dirty_bitmap.as_mut() {
        bitmap.set(offset);
    }
}

/// Reaper entry point: drain every ring once.
pub(crate) fn reap_all(shared: &EngineShared) -> Result<u64> {
    let mut state = shared.state.lock().expect("slot lock poisoned");
    drain_ring_set(&*shared.hv, &mut state, None, shared.config.page_size)
}
