//! Resource reservation and placement validation.
//!
//! `reserve_and_validate` builds the deduplicated union of everything a
//! submission needs resident (the named resource list, the address
//! space's permanent set and page-table buffers, and the user-fence
//! target), takes the all-or-nothing [`ReservationTicket`] over it, and
//! proves a
//! placement for every buffer under the migration budget. Validation that
//! runs out of memory falls back to a last-resort eviction scan over the
//! submission's own working set before giving up.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::debug;

use talon_mem::{
    Buffer, BufferRef, MemDomain, MoveStats, PlacementBackend, PlacementError,
    ReservationTicket, ReserveError,
};

use crate::chunk::DecodedSubmission;
use crate::device::Device;
use crate::error::{Result, RetryReason, SubmitError};
use crate::throttle::MoveThreshold;
use crate::vm::AddressSpace;

/// Validation-order classes, earliest first: the address space's own
/// page-table buffers, then buffers named by more than one source list,
/// then the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ValidateOrder {
    PageTable,
    SharedAcrossLists,
    Owned,
}

#[derive(Debug)]
pub(crate) struct WorkingEntry {
    pub bo: BufferRef,
    pub write: bool,
    order: ValidateOrder,
    /// Captured backing-pages version for user-backed buffers; rechecked
    /// at commit.
    pub captured_pages: Option<u64>,
    /// The captured pages are newer than the GPU bindings: force a CPU
    /// placement so the new pages can be bound before normal validation.
    fresh_user_pages: bool,
}

/// Result of a successful reservation: the held ticket, the ordered
/// working set, and what validation actually migrated.
#[derive(Debug)]
pub(crate) struct ValidatedReservation {
    pub ticket: ReservationTicket,
    pub entries: Vec<WorkingEntry>,
    pub moved: MoveStats,
}

fn merge(
    entries: &mut Vec<WorkingEntry>,
    by_id: &mut HashMap<u64, usize>,
    bo: BufferRef,
    write: bool,
    order: ValidateOrder,
) {
    match by_id.entry(bo.id()) {
        Entry::Occupied(slot) => {
            let entry = &mut entries[*slot.get()];
            entry.write |= write;
            // Named by more than one source list: would have been a
            // partially locked duplicate without the merge.
            if entry.order == ValidateOrder::Owned {
                entry.order = ValidateOrder::SharedAcrossLists;
            }
        }
        Entry::Vacant(slot) => {
            slot.insert(entries.len());
            entries.push(WorkingEntry {
                bo,
                write,
                order,
                captured_pages: None,
                fresh_user_pages: false,
            });
        }
    }
}

struct Validator<'a> {
    placement: &'a dyn PlacementBackend,
    threshold: MoveThreshold,
    /// Part of VRAM is not CPU-visible, so CPU-access-required buffers
    /// draw from the visible sub-budget.
    visible_limited: bool,
    moved: MoveStats,
    /// Last-resort eviction scan position over the working set; walks
    /// backwards from the tail and never revisits rejected candidates.
    evict_cursor: Option<usize>,
    /// Buffers relocated by the eviction scan. They already have a
    /// placement and are taken out of the normal validation walk.
    evicted: Vec<u64>,
}

impl Validator<'_> {
    /// Place one buffer, directing it by the remaining migration budget:
    /// under budget the buffer's preferred domains are requested (unless
    /// the visible sub-budget is exhausted and the buffer needs CPU
    /// access); over budget only the fallback-allowed set is. A first
    /// attempt that runs out of memory in a narrower set is retried once
    /// against the allowed set before the failure surfaces.
    fn validate_one(&mut self, bo: &Buffer) -> std::result::Result<(), PlacementError> {
        if bo.is_pinned() {
            return Ok(());
        }

        let domains = if self.moved.bytes_moved < self.threshold.max_bytes {
            if self.visible_limited
                && bo.cpu_access_required()
                && self.moved.bytes_moved_visible >= self.threshold.max_visible_bytes
            {
                bo.allowed_domains()
            } else {
                bo.preferred_domains()
            }
        } else {
            bo.allowed_domains()
        };

        match self.placement.validate(bo, domains) {
            Ok(stats) => {
                self.moved.accumulate(stats);
                Ok(())
            }
            Err(PlacementError::OutOfMemory { .. }) if domains != bo.allowed_domains() => {
                let stats = self.placement.validate(bo, bo.allowed_domains())?;
                self.moved.accumulate(stats);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Last resort when validation reports out-of-memory: scan backwards
    /// through the working set for one buffer that occupies a domain
    /// `target` needs and is allowed somewhere else, and move it there.
    /// Returns true if something was relocated (the caller retries
    /// validation), false when the scan is exhausted. First candidate in
    /// scan order wins; this is not a best-fit search.
    fn try_evict(&mut self, entries: &[WorkingEntry], target: &Buffer) -> bool {
        let needed = target.allowed_domains();

        while let Some(index) = self.evict_cursor {
            let next = index.checked_sub(1);
            let candidate = &entries[index].bo;

            // Reached the buffer being validated: nothing left to scan.
            if candidate.id() == target.id() {
                return false;
            }
            if candidate.is_pinned() {
                self.evict_cursor = next;
                continue;
            }
            let Some(placement) = candidate.current_placement() else {
                self.evict_cursor = next;
                continue;
            };
            // Only worth moving if it occupies space the target needs...
            if !needed.intersects(placement.domain) {
                self.evict_cursor = next;
                continue;
            }
            // ...and has somewhere else to go.
            let other = candidate.allowed_domains() - needed;
            if other.is_empty() {
                self.evict_cursor = next;
                continue;
            }

            match self.placement.validate(candidate, other) {
                Ok(stats) => {
                    debug!(
                        evicted = candidate.id(),
                        for_bo = target.id(),
                        to = ?other,
                        "evicted working-set buffer"
                    );
                    self.moved.accumulate(stats);
                    self.evicted.push(candidate.id());
                    self.evict_cursor = next;
                    return true;
                }
                // A candidate that fails to move ends the scan.
                Err(_) => return false,
            }
        }

        false
    }

    /// Validate the working-set entry at `index`, evicting and retrying
    /// on out-of-memory until placement succeeds or the eviction scan
    /// runs dry.
    fn validate_entry(&mut self, entries: &[WorkingEntry], index: usize) -> Result<()> {
        let entry = &entries[index];
        // An evicted buffer was already placed by the scan; revalidating
        // it here could migrate it straight back.
        if self.evicted.contains(&entry.bo.id()) {
            return Ok(());
        }
        if self.evict_cursor == Some(index) {
            self.evict_cursor = None;
        }

        if entry.fresh_user_pages {
            // Fresh user pages can only be bound from the CPU domain.
            let stats = self
                .placement
                .validate(&entry.bo, MemDomain::CPU)
                .map_err(map_placement)?;
            self.moved.accumulate(stats);
            if let Some(version) = entry.captured_pages {
                entry.bo.bind_user_pages(version);
            }
        }

        loop {
            match self.validate_one(&entry.bo) {
                Ok(()) => return Ok(()),
                Err(PlacementError::OutOfMemory { .. }) => {
                    if !self.try_evict(entries, &entry.bo) {
                        return Err(SubmitError::OutOfMemory);
                    }
                }
                Err(err) => return Err(map_placement(err)),
            }
        }
    }
}

fn map_placement(err: PlacementError) -> SubmitError {
    match err {
        PlacementError::OutOfMemory { .. } => SubmitError::OutOfMemory,
        PlacementError::DeviceFault(msg) => SubmitError::DeviceFault(msg),
    }
}

/// Reserve and validate everything `decoded` needs resident.
///
/// On success the returned ticket holds every buffer and the migration
/// budget has been debited by the bytes actually moved. On failure
/// nothing stays reserved and the budget is untouched: bytes moved
/// before a failure were genuinely moved, but the submission that caused
/// them never runs, so they are not charged against future submissions.
pub(crate) fn reserve_and_validate(
    device: &Device,
    vm: &AddressSpace,
    decoded: &DecodedSubmission,
) -> Result<ValidatedReservation> {
    let mut entries: Vec<WorkingEntry> = Vec::new();
    let mut by_id: HashMap<u64, usize> = HashMap::new();

    for pt in vm.page_tables() {
        merge(&mut entries, &mut by_id, pt.clone(), true, ValidateOrder::PageTable);
    }
    for bo in vm.permanent() {
        merge(&mut entries, &mut by_id, bo, false, ValidateOrder::Owned);
    }
    for res in &decoded.resources {
        merge(
            &mut entries,
            &mut by_id,
            res.bo.clone(),
            res.write,
            ValidateOrder::Owned,
        );
    }
    if let Some(uf) = &decoded.user_fence {
        merge(&mut entries, &mut by_id, uf.bo.clone(), false, ValidateOrder::Owned);
    }

    // Snapshot user-backed page state before locking anything; the commit
    // phase rechecks these captures.
    for entry in &mut entries {
        if entry.bo.is_user_backed() {
            entry.captured_pages = entry.bo.user_pages_version();
            entry.fresh_user_pages = entry.bo.user_pages_need_rebind();
        }
    }

    entries.sort_by_key(|e| e.order);

    let bos: Vec<BufferRef> = entries.iter().map(|e| e.bo.clone()).collect();
    let ticket = ReservationTicket::acquire(&bos).map_err(|err| {
        let ReserveError::Contended { id } = err;
        debug!(bo = id, "submission lost the reservation race");
        SubmitError::Retry {
            reason: RetryReason::TicketContended,
        }
    })?;

    let threshold = device.budget().threshold(device.placement());
    let mut validator = Validator {
        placement: device.placement(),
        threshold,
        visible_limited: device.placement().visible_vram_stats().is_some(),
        moved: MoveStats::default(),
        evict_cursor: entries.len().checked_sub(1),
        evicted: Vec::new(),
    };

    for index in 0..entries.len() {
        if let Err(err) = validator.validate_entry(&entries, index) {
            ticket.release_backoff();
            return Err(err);
        }
    }

    device.budget().report_moved(validator.moved);

    Ok(ValidatedReservation {
        ticket,
        entries,
        moved: validator.moved,
    })
}
