use std::sync::Mutex;

use talon_mem::{Buffer, BufferDesc, BufferRef, MemDomain};
use talon_sync::Fence;

/// Per-process GPU virtual address space, seen through the narrow contract
/// the admission path needs: the page-table backing buffers that must be
/// resident before any job from this space runs, the process's permanent
/// resident set, and the fence of the most recent mapping update.
///
/// The page-table manager itself (PTE encoding, directory walks) is an
/// external collaborator; it records its update fences here via
/// [`record_update_fence`](Self::record_update_fence).
#[derive(Debug)]
pub struct AddressSpace {
    page_tables: Vec<BufferRef>,
    permanent: Mutex<Vec<BufferRef>>,
    last_table_update: Mutex<Option<Fence>>,
}

impl AddressSpace {
    /// `page_table_count` backing buffers of `page_table_bytes` each.
    /// Page tables prefer VRAM but may spill to GPU-mapped system memory.
    pub fn new(page_table_count: usize, page_table_bytes: u64) -> Self {
        let page_tables = (0..page_table_count)
            .map(|_| {
                Buffer::new(BufferDesc::new(
                    page_table_bytes,
                    MemDomain::VRAM,
                    MemDomain::VRAM | MemDomain::GTT,
                ))
            })
            .collect();
        Self {
            page_tables,
            permanent: Mutex::new(Vec::new()),
            last_table_update: Mutex::new(None),
        }
    }

    /// Internal buffers backing this space's page tables. Validated ahead
    /// of everything else in a submission.
    pub fn page_tables(&self) -> &[BufferRef] {
        &self.page_tables
    }

    /// Add a buffer to the process's default resident set: it joins every
    /// submission's reservation without being named in a resource list.
    pub fn add_permanent(&self, bo: BufferRef) {
        self.permanent.lock().unwrap().push(bo);
    }

    pub fn permanent(&self) -> Vec<BufferRef> {
        self.permanent.lock().unwrap().clone()
    }

    /// Page-table manager contract: record the completion fence of a
    /// mapping update so later jobs order behind it.
    pub fn record_update_fence(&self, fence: Fence) {
        *self.last_table_update.lock().unwrap() = Some(fence);
    }

    /// Bring this space's mappings up to date for a job over the given
    /// buffers and return the fence the job must wait on, if an update is
    /// outstanding.
    pub fn update_mappings<'a>(
        &self,
        _job_buffers: impl IntoIterator<Item = &'a BufferRef>,
    ) -> Option<Fence> {
        self.last_table_update.lock().unwrap().clone()
    }
}
