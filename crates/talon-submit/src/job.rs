use talon_mem::BufferRef;
use talon_sync::Fence;

use crate::context::QueueSelector;

/// One work item carried by a job, pointing at command bytes in the
/// submitter's virtual address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWork {
    pub cmd_va: u64,
    pub cmd_size_bytes: u32,
    pub flags: u32,
}

/// The set of completion tokens a job must wait on before executing.
///
/// Membership is what matters; insertion order is irrelevant. Tokens are
/// deduplicated by identity so a fence reachable through several paths
/// (explicit dependency, sync object, buffer last-use) is waited on once.
#[derive(Debug, Default)]
pub struct DepSet {
    fences: Vec<Fence>,
}

impl DepSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fence: Fence) {
        if self.fences.iter().any(|f| f.same(&fence)) {
            return;
        }
        self.fences.push(fence);
    }

    pub fn add_opt(&mut self, fence: Option<Fence>) {
        if let Some(fence) = fence {
            self.add(fence);
        }
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub fn fences(&self) -> &[Fence] {
        &self.fences
    }

    /// True once every prerequisite has signaled. Executors poll this (or
    /// wait each fence) before starting the job's work.
    pub fn all_signaled(&self) -> bool {
        self.fences.iter().all(|f| f.is_signaled())
    }
}

/// One buffer in a job's working set, with the access mode the executor
/// needs for cache maintenance and retirement.
#[derive(Debug, Clone)]
pub struct JobBuffer {
    pub bo: BufferRef,
    pub write: bool,
}

/// A fully prepared job, handed to an engine queue at commit.
#[derive(Debug)]
pub struct Job {
    pub context_id: u32,
    pub queue: QueueSelector,
    /// Per-context monotonic sequence; also the submitter's handle.
    pub sequence: u64,
    pub work: Vec<JobWork>,
    pub deps: DepSet,
    /// Signaled by the executor when the job's GPU work finishes.
    pub fence: Fence,
    /// Everything the job holds resident, kept alive until retirement.
    pub buffers: Vec<JobBuffer>,
    /// Optional host-visible fence slot: (buffer, byte offset).
    pub user_fence: Option<(BufferRef, u64)>,
}
