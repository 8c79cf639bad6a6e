use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::domain::{MemDomain, Placement};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// No pool in the requested domain set can hold the buffer. The caller
    /// decides whether to retry with a wider set or evict.
    #[error("no space in domain set {domains:?} for {size_bytes} bytes")]
    OutOfMemory {
        domains: MemDomain,
        size_bytes: u64,
    },

    /// Unrecoverable device-side failure; propagated to the submitter
    /// unchanged, never retried.
    #[error("device fault: {0}")]
    DeviceFault(&'static str),
}

/// Bytes actually migrated by a validate call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStats {
    pub bytes_moved: u64,
    pub bytes_moved_visible: u64,
}

impl MoveStats {
    pub fn accumulate(&mut self, other: MoveStats) {
        self.bytes_moved += other.bytes_moved;
        self.bytes_moved_visible += other.bytes_moved_visible;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl DomainStats {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// The narrow contract to the physical memory allocator: place a buffer
/// somewhere in a domain set, report what was actually migrated, and
/// answer pool-occupancy queries for migration throttling.
pub trait PlacementBackend: Send + Sync {
    /// Ensure `bo` is resident somewhere in `domains`.
    ///
    /// Must be a no-op (zero [`MoveStats`]) when the buffer's current
    /// placement is already inside `domains`. The caller holds the
    /// buffer's reservation.
    fn validate(&self, bo: &Buffer, domains: MemDomain) -> Result<MoveStats, PlacementError>;

    /// Occupancy of a single domain pool.
    fn domain_stats(&self, domain: MemDomain) -> DomainStats;

    /// Occupancy of the CPU-visible slice of VRAM, or `None` when all of
    /// VRAM is CPU-visible (no separate sub-budget needed).
    fn visible_vram_stats(&self) -> Option<DomainStats>;
}

#[derive(Debug, Clone)]
pub struct RamPlacementConfig {
    pub vram_bytes: u64,
    /// CPU-visible slice of VRAM. Equal to `vram_bytes` means fully
    /// visible VRAM.
    pub visible_vram_bytes: u64,
    pub gtt_bytes: u64,
}

impl Default for RamPlacementConfig {
    fn default() -> Self {
        Self {
            vram_bytes: 256 << 20,
            visible_vram_bytes: 256 << 20,
            gtt_bytes: 1 << 30,
        }
    }
}

#[derive(Debug, Default)]
struct PoolUsage {
    vram_used: u64,
    vram_visible_used: u64,
    gtt_used: u64,
    cpu_used: u64,
}

/// Software placement backend with per-domain byte accounting.
///
/// Stands in for the hardware allocator: real bookkeeping, no data
/// movement. CPU memory is treated as unbounded; VRAM and GTT enforce
/// their configured capacities, and `cpu_access_required` buffers
/// additionally fit-check the visible VRAM slice.
#[derive(Debug)]
pub struct RamPlacement {
    cfg: RamPlacementConfig,
    usage: Mutex<PoolUsage>,
    injected_fault: Mutex<Option<&'static str>>,
}

impl RamPlacement {
    pub fn new(cfg: RamPlacementConfig) -> Self {
        Self {
            cfg,
            usage: Mutex::new(PoolUsage::default()),
            injected_fault: Mutex::new(None),
        }
    }

    /// Make the next `validate` call fail with a device fault. Test hook
    /// for the fatal-error propagation path.
    pub fn inject_fault(&self, msg: &'static str) {
        *self.injected_fault.lock().unwrap() = Some(msg);
    }

    fn charge(usage: &mut PoolUsage, domain: MemDomain, size: u64, visible: bool) {
        if domain == MemDomain::VRAM {
            usage.vram_used += size;
            if visible {
                usage.vram_visible_used += size;
            }
        } else if domain == MemDomain::GTT {
            usage.gtt_used += size;
        } else {
            usage.cpu_used += size;
        }
    }

    fn refund(usage: &mut PoolUsage, placement: Placement, size: u64) {
        if placement.domain == MemDomain::VRAM {
            usage.vram_used -= size;
            if placement.cpu_visible {
                usage.vram_visible_used -= size;
            }
        } else if placement.domain == MemDomain::GTT {
            usage.gtt_used -= size;
        } else {
            usage.cpu_used -= size;
        }
    }

    fn fits(&self, usage: &PoolUsage, bo: &Buffer, domain: MemDomain) -> bool {
        let size = bo.size_bytes();
        if domain == MemDomain::VRAM {
            if usage.vram_used + size > self.cfg.vram_bytes {
                return false;
            }
            if bo.cpu_access_required()
                && usage.vram_visible_used + size > self.cfg.visible_vram_bytes
            {
                return false;
            }
            true
        } else if domain == MemDomain::GTT {
            usage.gtt_used + size <= self.cfg.gtt_bytes
        } else {
            // Host memory is effectively unbounded here.
            true
        }
    }
}

impl PlacementBackend for RamPlacement {
    fn validate(&self, bo: &Buffer, domains: MemDomain) -> Result<MoveStats, PlacementError> {
        if let Some(msg) = self.injected_fault.lock().unwrap().take() {
            return Err(PlacementError::DeviceFault(msg));
        }

        let current = bo.current_placement();
        if let Some(placement) = current {
            if domains.contains(placement.domain) {
                return Ok(MoveStats::default());
            }
        }

        let mut usage = self.usage.lock().unwrap();
        for domain in MemDomain::PREFERENCE_ORDER {
            if !domains.contains(domain) {
                continue;
            }
            if !self.fits(&usage, bo, domain) {
                continue;
            }

            let visible = domain == MemDomain::VRAM && bo.cpu_access_required();
            if let Some(old) = current {
                Self::refund(&mut usage, old, bo.size_bytes());
            }
            Self::charge(&mut usage, domain, bo.size_bytes(), visible);
            bo.set_placement(Placement {
                domain,
                cpu_visible: visible,
            });

            // First placement allocates; only a domain change migrates data.
            let moved = if current.is_some() { bo.size_bytes() } else { 0 };
            if moved > 0 {
                debug!(
                    bo = bo.id(),
                    from = ?current.map(|p| p.domain),
                    to = ?domain,
                    bytes = moved,
                    "migrated buffer"
                );
            }
            return Ok(MoveStats {
                bytes_moved: moved,
                bytes_moved_visible: if visible { moved } else { 0 },
            });
        }

        warn!(bo = bo.id(), ?domains, size = bo.size_bytes(), "placement out of memory");
        Err(PlacementError::OutOfMemory {
            domains,
            size_bytes: bo.size_bytes(),
        })
    }

    fn domain_stats(&self, domain: MemDomain) -> DomainStats {
        let usage = self.usage.lock().unwrap();
        if domain == MemDomain::VRAM {
            DomainStats {
                total_bytes: self.cfg.vram_bytes,
                used_bytes: usage.vram_used,
            }
        } else if domain == MemDomain::GTT {
            DomainStats {
                total_bytes: self.cfg.gtt_bytes,
                used_bytes: usage.gtt_used,
            }
        } else {
            DomainStats {
                total_bytes: u64::MAX,
                used_bytes: usage.cpu_used,
            }
        }
    }

    fn visible_vram_stats(&self) -> Option<DomainStats> {
        if self.cfg.visible_vram_bytes >= self.cfg.vram_bytes {
            return None;
        }
        let usage = self.usage.lock().unwrap();
        Some(DomainStats {
            total_bytes: self.cfg.visible_vram_bytes,
            used_bytes: usage.vram_visible_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDesc;

    fn vram_bo(size: u64) -> crate::BufferRef {
        Buffer::new(BufferDesc::new(
            size,
            MemDomain::VRAM,
            MemDomain::VRAM | MemDomain::GTT,
        ))
    }

    #[test]
    fn first_placement_allocates_without_counting_a_move() {
        let backend = RamPlacement::new(RamPlacementConfig::default());
        let bo = vram_bo(4096);

        let stats = backend.validate(&bo, MemDomain::VRAM).unwrap();
        assert_eq!(stats, MoveStats::default());
        assert_eq!(
            bo.current_placement().unwrap().domain,
            MemDomain::VRAM
        );
        assert_eq!(backend.domain_stats(MemDomain::VRAM).used_bytes, 4096);
    }

    #[test]
    fn revalidating_in_place_is_a_noop() {
        let backend = RamPlacement::new(RamPlacementConfig::default());
        let bo = vram_bo(4096);
        backend.validate(&bo, MemDomain::VRAM).unwrap();

        let stats = backend
            .validate(&bo, MemDomain::VRAM | MemDomain::GTT)
            .unwrap();
        assert_eq!(stats, MoveStats::default());
        assert_eq!(backend.domain_stats(MemDomain::VRAM).used_bytes, 4096);
    }

    #[test]
    fn migration_refunds_the_old_pool_and_reports_bytes() {
        let backend = RamPlacement::new(RamPlacementConfig::default());
        let bo = vram_bo(4096);
        backend.validate(&bo, MemDomain::VRAM).unwrap();

        let stats = backend.validate(&bo, MemDomain::GTT).unwrap();
        assert_eq!(stats.bytes_moved, 4096);
        assert_eq!(backend.domain_stats(MemDomain::VRAM).used_bytes, 0);
        assert_eq!(backend.domain_stats(MemDomain::GTT).used_bytes, 4096);
    }

    #[test]
    fn full_vram_reports_out_of_memory() {
        let backend = RamPlacement::new(RamPlacementConfig {
            vram_bytes: 8192,
            visible_vram_bytes: 8192,
            gtt_bytes: 1 << 20,
        });
        let a = vram_bo(8192);
        let b = vram_bo(4096);
        backend.validate(&a, MemDomain::VRAM).unwrap();

        let err = backend.validate(&b, MemDomain::VRAM).unwrap_err();
        assert_eq!(
            err,
            PlacementError::OutOfMemory {
                domains: MemDomain::VRAM,
                size_bytes: 4096
            }
        );
        // The wider set still succeeds by falling through to GTT.
        backend
            .validate(&b, MemDomain::VRAM | MemDomain::GTT)
            .unwrap();
        assert_eq!(backend.domain_stats(MemDomain::GTT).used_bytes, 4096);
    }

    #[test]
    fn cpu_access_required_is_bounded_by_the_visible_slice() {
        let backend = RamPlacement::new(RamPlacementConfig {
            vram_bytes: 1 << 20,
            visible_vram_bytes: 4096,
            gtt_bytes: 1 << 20,
        });

        let mut desc = BufferDesc::new(8192, MemDomain::VRAM, MemDomain::VRAM);
        desc.cpu_access_required = true;
        let visible_bo = Buffer::new(desc);

        // Plenty of VRAM, but the visible slice is too small.
        assert!(matches!(
            backend.validate(&visible_bo, MemDomain::VRAM),
            Err(PlacementError::OutOfMemory { .. })
        ));

        // A buffer without the CPU-access requirement uses the same pool
        // without touching the visible budget.
        let plain = vram_bo(8192);
        let stats = backend.validate(&plain, MemDomain::VRAM).unwrap();
        assert_eq!(stats.bytes_moved_visible, 0);
        assert_eq!(backend.visible_vram_stats().unwrap().used_bytes, 0);
    }

    #[test]
    fn fully_visible_vram_has_no_sub_budget() {
        let backend = RamPlacement::new(RamPlacementConfig::default());
        assert!(backend.visible_vram_stats().is_none());
    }

    #[test]
    fn injected_fault_fails_exactly_one_validate() {
        let backend = RamPlacement::new(RamPlacementConfig::default());
        let bo = vram_bo(4096);
        backend.inject_fault("bus error");

        assert_eq!(
            backend.validate(&bo, MemDomain::VRAM).unwrap_err(),
            PlacementError::DeviceFault("bus error")
        );
        backend.validate(&bo, MemDomain::VRAM).unwrap();
    }
}
