//! External collaborator interfaces: the hypervisor control-request boundary, the vCPU gang, and
//! the dirty-rate limiter.
//!
//! All boundary calls are synchronous and may block on the underlying transport; there is no
//! timeout semantics here. The traits exist so the engine can be exercised against in-process
//! fakes (see the integration tests) without a kernel.

use crate::slot::SlotFlags;

/// Kernel-style error number carried across the boundary.
pub type Errno = i32;

/// "Not found": for dirty-log calls this is a normal transient state, not a failure.
pub const ENOENT: Errno = 2;

/// One slot registration/deregistration request.
///
/// `slot` packs the slot id in the lower 16 bits and the address-space id in the upper 16.
/// `memory_size == 0` deregisters the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUpdate {
    pub slot: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
    pub flags: SlotFlags,
}

/// The hypervisor kernel module, reduced to the four control requests this engine issues.
pub trait Hypervisor: Send + Sync {
    /// Register, update, or (with `memory_size == 0`) deregister a slot.
    fn set_memory_region(&self, update: &SlotUpdate) -> Result<(), Errno>;

    /// Read the kernel's current dirty bitmap for `slot` into `bitmap`.
    ///
    /// Without manual dirty-log protection, the kernel clears its own state as a side effect.
    /// `ENOENT` means the slot has no dirty log yet.
    fn get_dirty_log(&self, slot: u32, bitmap: &mut [u64]) -> Result<(), Errno>;

    /// Clear `num_pages` pages of dirty state starting at `first_page`, re-protecting exactly the
    /// pages set in `bitmap`. `first_page` is 64-page aligned and `num_pages` is a 64-page
    /// multiple or runs to the end of the slot.
    fn clear_dirty_log(
        &self,
        slot: u32,
        first_page: u64,
        num_pages: u32,
        bitmap: &[u64],
    ) -> Result<(), Errno>;

    /// Tell the kernel it may reuse ring entries marked reset. Returns the number of entries the
    /// kernel acknowledged; the engine asserts this equals its own drained count.
    fn reset_dirty_rings(&self) -> Result<u64, Errno>;
}

impl<T: Hypervisor + ?Sized> Hypervisor for std::sync::Arc<T> {
    fn set_memory_region(&self, update: &SlotUpdate) -> Result<(), Errno> {
        (**self).set_memory_region(update)
    }

    fn get_dirty_log(&self, slot: u32, bitmap: &mut [u64]) -> Result<(), Errno> {
        (**self).get_dirty_log(slot, bitmap)
    }

    fn clear_dirty_log(
        &self,
        slot: u32,
        first_page: u64,
        num_pages: u32,
        bitmap: &[u64],
    ) -> Result<(), Errno> {
        (**self).clear_dirty_log(slot, first_page, num_pages, bitmap)
    }

    fn reset_dirty_rings(&self) -> Result<u64, Errno> {
        (**self).reset_dirty_rings()
    }
}

/// The vCPU-execution collaborator.
pub trait VcpuGang: Send + Sync {
    /// Kick every vCPU out of guest mode; returns once each has re-entered userspace at least
    /// once, so any hardware-buffered dirty state has reached the ring or bitmap.
    fn kick_all(&self);
}

impl<T: VcpuGang + ?Sized> VcpuGang for std::sync::Arc<T> {
    fn kick_all(&self) {
        (**self).kick_all()
    }
}

/// External dirty-rate-limiting subsystem. While it reports in-service, the reaper skips its
/// cycles entirely and ring-full handling drains only the affected vCPU.
pub trait DirtyRateLimiter: Send + Sync {
    fn in_service(&self) -> bool;
}

impl<T: DirtyRateLimiter + ?Sized> DirtyRateLimiter for std::sync::Arc<T> {
    fn in_service(&self) -> bool {
        (**self).in_service()
    }
}

/// Default limiter: never throttling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLimiter;

impl DirtyRateLimiter for NoLimiter {
    fn in_service(&self) -> bool {
        false
    }
}
