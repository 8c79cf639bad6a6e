//! Buffer-object memory model for the talon GPU driver stack.
//!
//! This crate owns everything the submission path needs to reason about
//! GPU-visible memory without owning the memory itself:
//!
//! - [`MemDomain`]: memory pool classes (device VRAM, GPU-mapped system
//!   memory, plain host memory) and domain-set arithmetic
//! - [`Buffer`]: a GPU-addressable allocation with preferred/allowed
//!   domains, pinning, optional user-backed (pageable) state and a
//!   last-use fence slot
//! - [`PlacementBackend`]: the narrow "place this buffer in domain set D"
//!   contract to the physical allocator, plus [`RamPlacement`], a
//!   capacity-accounting software implementation
//! - [`ReservationTicket`]: the all-or-nothing lock a submission holds
//!   over its full, deduplicated buffer set
//!
//! Buffers are shared by reference count ([`BufferRef`]) across submission
//! resource lists, per-process address spaces and the device registry; a
//! buffer is destroyed only when the last holder drops it.

mod buffer;
mod domain;
mod placement;
mod reservation;

pub use buffer::{Buffer, BufferDesc, BufferRef, BufferTable};
pub use domain::{MemDomain, Placement};
pub use placement::{
    DomainStats, MoveStats, PlacementBackend, PlacementError, RamPlacement, RamPlacementConfig,
};
pub use reservation::{ReservationTicket, ReserveError};
