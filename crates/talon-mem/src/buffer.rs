use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use talon_sync::Fence;

use crate::domain::{MemDomain, Placement};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Creation-time description of a buffer object.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size_bytes: u64,
    pub preferred_domains: MemDomain,
    pub allowed_domains: MemDomain,
    /// The buffer must stay CPU-mappable (limits it to the visible slice
    /// of VRAM when placed there).
    pub cpu_access_required: bool,
    /// Backed by pageable user memory rather than driver allocations.
    pub user_backed: bool,
}

impl BufferDesc {
    pub fn new(size_bytes: u64, preferred: MemDomain, allowed: MemDomain) -> Self {
        Self {
            size_bytes,
            preferred_domains: preferred,
            // A buffer must always be allowed where it is preferred.
            allowed_domains: allowed | preferred,
            cpu_access_required: false,
            user_backed: false,
        }
    }
}

#[derive(Debug)]
struct UserBacking {
    /// Bumped by host-side paging activity; submissions snapshot it at
    /// reservation time and compare at commit time.
    pages_version: AtomicU64,
    /// Version of the pages the GPU bindings were last built against.
    /// `u64::MAX` until the first bind.
    bound_version: AtomicU64,
}

#[derive(Debug)]
struct BufferState {
    placement: Option<Placement>,
    /// Ticket id of the reservation currently holding this buffer.
    reserved_by: Option<u64>,
    /// Completion fence of the last job that touched this buffer.
    last_use: Option<Fence>,
}

/// A GPU-addressable memory allocation.
///
/// Shared as [`BufferRef`]; the allocation is destroyed when the last
/// holder across submission lists, address spaces and the device registry
/// drops its reference.
#[derive(Debug)]
pub struct Buffer {
    id: u64,
    size_bytes: u64,
    preferred_domains: MemDomain,
    allowed_domains: MemDomain,
    cpu_access_required: bool,
    pin_count: AtomicU32,
    user: Option<UserBacking>,
    state: Mutex<BufferState>,
}

pub type BufferRef = Arc<Buffer>;

impl Buffer {
    pub fn new(desc: BufferDesc) -> BufferRef {
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            size_bytes: desc.size_bytes,
            preferred_domains: desc.preferred_domains,
            allowed_domains: desc.allowed_domains | desc.preferred_domains,
            cpu_access_required: desc.cpu_access_required,
            pin_count: AtomicU32::new(0),
            user: desc.user_backed.then(|| UserBacking {
                pages_version: AtomicU64::new(0),
                bound_version: AtomicU64::new(u64::MAX),
            }),
            state: Mutex::new(BufferState {
                placement: None,
                reserved_by: None,
                last_use: None,
            }),
        })
    }

    /// Globally unique, monotonically assigned. Doubles as the
    /// deadlock-avoidance acquisition order for reservations.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn preferred_domains(&self) -> MemDomain {
        self.preferred_domains
    }

    pub fn allowed_domains(&self) -> MemDomain {
        self.allowed_domains
    }

    pub fn cpu_access_required(&self) -> bool {
        self.cpu_access_required
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin without matching pin");
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    pub fn is_user_backed(&self) -> bool {
        self.user.is_some()
    }

    /// Current backing-pages version of a user-backed buffer.
    pub fn user_pages_version(&self) -> Option<u64> {
        self.user
            .as_ref()
            .map(|u| u.pages_version.load(Ordering::Acquire))
    }

    /// Host-side paging activity replaced the backing pages. Submissions
    /// that captured the previous version must restart.
    pub fn invalidate_user_pages(&self) {
        if let Some(user) = &self.user {
            user.pages_version.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// The captured pages differ from what the GPU bindings were built
    /// against, so validation must rebind before this buffer is usable.
    pub fn user_pages_need_rebind(&self) -> bool {
        self.user.as_ref().is_some_and(|u| {
            u.bound_version.load(Ordering::Acquire) != u.pages_version.load(Ordering::Acquire)
        })
    }

    /// Record that GPU bindings now cover the pages of `version`.
    pub fn bind_user_pages(&self, version: u64) {
        if let Some(user) = &self.user {
            user.bound_version.store(version, Ordering::Release);
        }
    }

    pub fn current_placement(&self) -> Option<Placement> {
        self.state.lock().unwrap().placement
    }

    /// Record a new physical location. Placement-backend use only.
    pub fn set_placement(&self, placement: Placement) {
        debug_assert_eq!(placement.domain.bits().count_ones(), 1);
        self.state.lock().unwrap().placement = Some(placement);
    }

    pub fn last_use_fence(&self) -> Option<Fence> {
        self.state.lock().unwrap().last_use.clone()
    }

    /// Replace the last-use marker. Reservation-release use only; the
    /// caller must hold this buffer's reservation.
    pub fn attach_fence(&self, fence: Fence) {
        self.state.lock().unwrap().last_use = Some(fence);
    }

    pub(crate) fn try_reserve(&self, ticket_id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.reserved_by.is_some() {
            return false;
        }
        state.reserved_by = Some(ticket_id);
        true
    }

    pub(crate) fn unreserve(&self, ticket_id: u64) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            state.reserved_by,
            Some(ticket_id),
            "unreserve by a ticket that does not hold buffer {}",
            self.id
        );
        state.reserved_by = None;
    }

    pub fn reserved_by(&self) -> Option<u64> {
        self.state.lock().unwrap().reserved_by
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_by().is_some()
    }
}

/// Handle registry mapping wire handles to live buffers.
///
/// `lookup` clones the `Arc`, pinning the buffer against destruction for
/// as long as the caller holds the reference.
#[derive(Debug, Default)]
pub struct BufferTable {
    bufs: Mutex<HashMap<u32, BufferRef>>,
    next_handle: Mutex<u32>,
}

impl BufferTable {
    pub fn new() -> Self {
        Self {
            bufs: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        }
    }

    pub fn create(&self, desc: BufferDesc) -> (u32, BufferRef) {
        let bo = Buffer::new(desc);
        let mut next = self.next_handle.lock().unwrap();
        let handle = *next;
        *next += 1;
        self.bufs.lock().unwrap().insert(handle, bo.clone());
        (handle, bo)
    }

    pub fn lookup(&self, handle: u32) -> Option<BufferRef> {
        self.bufs.lock().unwrap().get(&handle).cloned()
    }

    pub fn destroy(&self, handle: u32) -> bool {
        self.bufs.lock().unwrap().remove(&handle).is_some()
    }
}
