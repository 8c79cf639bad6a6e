use bitflags::bitflags;

bitflags! {
    /// Memory pool classes a buffer can live in.
    ///
    /// A `MemDomain` value is used both as a single location (exactly one
    /// bit, see [`Placement`]) and as a domain set (preferred/allowed sets
    /// on a buffer, target sets passed to the placement backend).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemDomain: u32 {
        /// Fast on-device memory.
        const VRAM = 1 << 0;
        /// System memory mapped through the GPU aperture.
        const GTT = 1 << 1;
        /// Plain host memory, not GPU-mapped.
        const CPU = 1 << 2;
    }
}

impl MemDomain {
    /// Iteration order used when picking a concrete pool out of a set:
    /// fastest first.
    pub const PREFERENCE_ORDER: [MemDomain; 3] =
        [MemDomain::VRAM, MemDomain::GTT, MemDomain::CPU];
}

/// Where a buffer currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Exactly one domain bit.
    pub domain: MemDomain,
    /// Set when the buffer occupies the CPU-visible slice of VRAM.
    pub cpu_visible: bool,
}
