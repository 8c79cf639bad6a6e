use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

use talon_sync::Fence;

use crate::buffer::{Buffer, BufferRef};

static NEXT_TICKET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReserveError {
    /// Another submission holds a buffer in the set. The caller must back
    /// off and restart the whole admission; partial progress is discarded.
    #[error("reservation contended on buffer {id}")]
    Contended { id: u64 },
}

/// The all-or-nothing lock over a submission's full buffer set.
///
/// Acquisition locks buffers in ascending id order (the global acquisition
/// sequence), so two submissions contending on overlapping sets cannot
/// deadlock: one of them fails to take some buffer and backs off
/// completely. A held ticket guarantees no reserved buffer can be
/// re-reserved, and release happens exactly once: either
/// [`release_and_fence`](Self::release_and_fence) on success or
/// [`release_backoff`](Self::release_backoff) (also the drop path) on
/// failure.
#[derive(Debug)]
pub struct ReservationTicket {
    id: u64,
    /// Sorted by buffer id, deduplicated; every entry is reserved by us.
    held: Vec<BufferRef>,
    released: bool,
}

impl ReservationTicket {
    /// Reserve every buffer in `buffers` or none of them.
    ///
    /// Duplicate references to the same buffer are merged; callers may
    /// pass overlapping lists.
    pub fn acquire(buffers: &[BufferRef]) -> Result<Self, ReserveError> {
        let id = NEXT_TICKET_ID.fetch_add(1, Ordering::Relaxed);

        let mut sorted: Vec<BufferRef> = buffers.to_vec();
        sorted.sort_by_key(|bo| bo.id());
        sorted.dedup_by_key(|bo| bo.id());

        for (taken, bo) in sorted.iter().enumerate() {
            if !bo.try_reserve(id) {
                for held in &sorted[..taken] {
                    held.unreserve(id);
                }
                debug!(ticket = id, bo = bo.id(), "reservation contended, backing off");
                return Err(ReserveError::Contended { id: bo.id() });
            }
        }

        Ok(Self {
            id,
            held: sorted,
            released: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The reserved set, ascending by buffer id.
    pub fn held(&self) -> &[BufferRef] {
        &self.held
    }

    /// Does this ticket hold `bo`'s reservation?
    pub fn holds(&self, bo: &Buffer) -> bool {
        bo.reserved_by() == Some(self.id)
    }

    /// Success path: publish `fence` as every reserved buffer's last-use
    /// marker, then release. The attach and the release are the only
    /// point where the buffers become visible to other submitters again,
    /// and they become visible already carrying the new token.
    pub fn release_and_fence(mut self, fence: &Fence) {
        for bo in &self.held {
            bo.attach_fence(fence.clone());
            bo.unreserve(self.id);
        }
        self.released = true;
    }

    /// Failure path: unconditionally unlock without touching last-use
    /// markers.
    pub fn release_backoff(mut self) {
        self.backoff();
    }

    fn backoff(&mut self) {
        if self.released {
            return;
        }
        for bo in &self.held {
            bo.unreserve(self.id);
        }
        self.released = true;
    }
}

impl Drop for ReservationTicket {
    fn drop(&mut self) {
        // An abandoned ticket (error unwind) must never leave buffers
        // reserved.
        self.backoff();
    }
}
