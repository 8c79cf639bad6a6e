//! Shared harness for admission-path integration tests: a device with a
//! software placement backend, a hand-advanced clock, one registered
//! engine queue, and a context + address space pair for the default
//! submitter.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::sync::Arc;

use talon_mem::{BufferDesc, BufferRef, MemDomain, RamPlacement, RamPlacementConfig};
use talon_submit::{Config, Context, Device, FifoQueue, Job, ManualClock, QueueSelector};

pub const QUEUE: QueueSelector = QueueSelector {
    engine_class: 0,
    engine_instance: 0,
    index: 0,
};

pub struct Harness {
    pub device: Device,
    pub queue: Arc<FifoQueue>,
    pub ctx_id: u32,
    pub ctx: Arc<Context>,
    pub vm: talon_submit::AddressSpace,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_placement(RamPlacementConfig::default())
    }

    pub fn with_placement(placement_cfg: RamPlacementConfig) -> Self {
        // Log output lands in the test capture buffer; visible on failure.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let placement = Arc::new(RamPlacement::new(placement_cfg));
        let clock = ManualClock::new();
        // Plenty of initial migration credit.
        clock.advance_us(1_000_000);
        let device = Device::with_clock(Config::default(), placement, clock);

        let queue = FifoQueue::new();
        device.register_queue(QUEUE, queue.clone());
        let (ctx_id, ctx) = device.create_context();

        Self {
            device,
            queue,
            ctx_id,
            ctx,
            vm: talon_submit::AddressSpace::new(1, 4096),
        }
    }

    pub fn buffer(
        &self,
        size: u64,
        preferred: MemDomain,
        allowed: MemDomain,
    ) -> (u32, BufferRef) {
        self.device
            .buffers()
            .create(BufferDesc::new(size, preferred, allowed))
    }

    /// Drain one job from the queue and signal its completion fence, the
    /// way the engine executor would after the GPU work finished.
    pub fn finish_next(&self) -> Job {
        let job = self.queue.pop().expect("no job queued");
        assert!(
            job.deps.all_signaled(),
            "executor started a job before its dependencies signaled"
        );
        job.fence.signal();
        job
    }
}
