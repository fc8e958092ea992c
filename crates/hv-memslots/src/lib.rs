//! Guest-memory virtualization engine: slot table, region-to-slot mapping, and dual dirty-page
//! tracking (bitmap pull and per-vCPU dirty rings).
//!
//! The engine maps a guest's physical address space onto the hypervisor's bounded table of memory
//! slots and tracks which guest pages were written since the last checkpoint, for live migration
//! and incremental snapshotting. Region add/remove/flag events come from the address-space
//! collaborator; merged per-slot dirty bitmaps go out to the migration consumer. The hypervisor
//! itself is behind the [`hv::Hypervisor`] trait, so everything here runs against in-process
//! fakes in tests.
//!
//! See [`engine::MemoryEngine`] for the entry point; `hv-dirty-bitmap` and `hv-dirty-ring` hold
//! the bitmap alignment algorithms and the kernel-shared ring protocol.

pub mod config;
pub mod engine;
pub mod error;
pub mod hv;
pub mod slot;

mod mapper;
mod reaper;

pub use config::MemoryConfig;
pub use engine::{DirtySnapshot, DrainStats, MemoryEngine, RegionAdd, RegionEvent};
pub use error::{MemoryError, Result};
pub use hv::{DirtyRateLimiter, Errno, Hypervisor, NoLimiter, SlotUpdate, VcpuGang, ENOENT};
pub use slot::{Slot, SlotFlags, SlotTable};

pub use hv_dirty_bitmap::{ClearWindow, DirtyBitmap, CLEAR_ALIGN_PAGES};
pub use hv_dirty_ring::{DirtyRing, RingEntry, RingProducer};
