use thiserror::Error;

/// Errors surfaced by the memory engine.
///
/// The caller (the VM lifecycle owner) decides what is fatal. A failed slot registration means
/// the engine's view and the hypervisor's view of guest memory have diverged, which is not
/// recoverable for the VM.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Every slot in the table is in use. Capacity is negotiated with the hypervisor once at
    /// initialization and never grows.
    #[error("slot table exhausted: all {capacity} slots in use")]
    CapacityExceeded { capacity: usize },

    /// A synchronous control request to the hypervisor failed.
    #[error("hypervisor {op} call failed: errno {errno}")]
    BoundaryCallFailed { op: &'static str, errno: i32 },

    /// No slot is registered for the given range, in an operation that requires one.
    #[error("no slot registered for range [{addr:#x}, +{size:#x})")]
    SlotNotFound { addr: u64, size: u64 },

    /// The address-space id has not been created on this engine.
    #[error("unknown address space {as_id}")]
    UnknownAddressSpace { as_id: u16 },

    /// A ring-mode-only operation was invoked with dirty rings disabled.
    #[error("dirty ring tracking is not enabled")]
    DirtyRingDisabled,

    /// Rejected engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
