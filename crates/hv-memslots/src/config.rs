use std::time::Duration;

use crate::error::{MemoryError, Result};

/// Engine configuration, fixed at construction.
///
/// `slot_capacity` and `manual_dirty_log_protect` are negotiated with the hypervisor at VM
/// initialization; `dirty_ring_size` selects ring-mode dirty tracking (0 keeps bitmap mode).
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Host page size in bytes; power of two.
    pub page_size: u64,
    /// Number of slots per address space. Defaults to 32 when the hypervisor reports nothing.
    pub slot_capacity: usize,
    /// Maximum size of one slot registration; larger regions are split. `None` = unbounded.
    /// Must be page-aligned.
    pub max_slot_size: Option<u64>,
    /// Dirty ring entry count per vCPU. 0 disables ring mode; otherwise a power of two.
    pub dirty_ring_size: u32,
    /// Whether the hypervisor supports (and we negotiated) manual dirty-log clearing. The clear
    /// path is a no-op without it: the kernel's get-dirty-log call then clears state itself.
    pub manual_dirty_log_protect: bool,
    /// Wake interval of the background reaper (ring mode only).
    pub reaper_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            slot_capacity: 32,
            max_slot_size: None,
            dirty_ring_size: 0,
            manual_dirty_log_protect: false,
            reaper_interval: Duration::from_secs(1),
        }
    }
}

impl MemoryConfig {
    /// True when ring-mode dirty tracking is selected.
    pub fn ring_mode(&self) -> bool {
        self.dirty_ring_size != 0
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(MemoryError::InvalidConfig(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if self.slot_capacity == 0 || self.slot_capacity > u16::MAX as usize {
            return Err(MemoryError::InvalidConfig(format!(
                "slot_capacity {} out of range 1..=65535",
                self.slot_capacity
            )));
        }
        if let Some(max) = self.max_slot_size {
            if max == 0 || max % self.page_size != 0 {
                return Err(MemoryError::InvalidConfig(format!(
                    "max_slot_size {max:#x} is not a positive multiple of the page size"
                )));
            }
        }
        if self.dirty_ring_size != 0 && !self.dirty_ring_size.is_power_of_two() {
            return Err(MemoryError::InvalidConfig(format!(
                "dirty_ring_size {} is not a power of two",
                self.dirty_ring_size
            )));
        }
        Ok(())
    }
}
