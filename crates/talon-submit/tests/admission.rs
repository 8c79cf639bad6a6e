//! End-to-end admission tests: decode → reserve → depend → commit →
//! query, against a software placement backend.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Harness, QUEUE};
use talon_mem::{
    Buffer, BufferRef, DomainStats, MemDomain, MoveStats, PlacementBackend, PlacementError,
    RamPlacement, RamPlacementConfig, ReservationTicket,
};
use talon_submit::{
    submit, wait_any, wait_one, Config, Device, FencePoint, FifoQueue, QueryStatus, RetryReason,
    SubmissionBuilder, SubmitError, RESOURCE_FLAG_WRITE,
};

#[test]
fn successful_submission_tokens_every_buffer_and_releases_reservations() {
    let h = Harness::new();
    let (ha, a) = h.buffer(4096, MemDomain::VRAM, MemDomain::VRAM | MemDomain::GTT);
    let (hb, b) = h.buffer(8192, MemDomain::GTT, MemDomain::GTT);

    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0x1000, 64)
        .resources(&[(ha, RESOURCE_FLAG_WRITE), (hb, 0)])
        .build();
    let seq = submit(&h.device, &h.vm, &payload).unwrap();
    assert_eq!(seq, 1);

    let job = h.queue.pop().unwrap();
    assert_eq!(job.sequence, seq);
    assert_eq!(job.work.len(), 1);

    // Every referenced buffer (including the address space's page
    // tables) carries the job's token and nothing is left reserved.
    let mut tokened: Vec<BufferRef> = vec![a.clone(), b.clone()];
    tokened.extend(h.vm.page_tables().iter().cloned());
    for bo in &tokened {
        assert!(!bo.is_reserved(), "buffer {} left reserved", bo.id());
        assert!(
            bo.last_use_fence().unwrap().same(&job.fence),
            "buffer {} not tokened with the job fence",
            bo.id()
        );
        assert!(bo.current_placement().is_some());
    }
}

#[test]
fn sequence_handles_are_monotonic_per_context() {
    let h = Harness::new();
    let (ha, _a) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);

    for expected in 1..=3u64 {
        let payload = SubmissionBuilder::new(h.ctx_id)
            .work(QUEUE, 0, 0)
            .resources(&[(ha, 0)])
            .build();
        let seq = submit(&h.device, &h.vm, &payload).unwrap();
        assert_eq!(seq, expected);
        h.finish_next();
    }
}

#[test]
fn failed_submission_rolls_back_fully_and_charges_no_budget() {
    // VRAM holds the address space's page table plus exactly one buffer.
    let h = Harness::with_placement(RamPlacementConfig {
        vram_bytes: 8192,
        visible_vram_bytes: 8192,
        gtt_bytes: 1 << 20,
    });

    // An immovable occupant takes all of VRAM.
    let (h_stuck, stuck) = h.buffer(4096, MemDomain::VRAM, MemDomain::VRAM);
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(h_stuck, 0)])
        .build();
    submit(&h.device, &h.vm, &payload).unwrap();
    h.finish_next();

    let threshold_before = h.device.budget().threshold(h.device.placement());

    // A VRAM-only buffer can no longer be placed.
    let (h_a, a) = h.buffer(4096, MemDomain::VRAM, MemDomain::VRAM);
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(h_a, 0), (h_stuck, 0)])
        .build();
    assert_eq!(
        submit(&h.device, &h.vm, &payload).unwrap_err(),
        SubmitError::OutOfMemory
    );

    // Full rollback: nothing reserved, and the untokened buffer stays
    // untokened.
    assert!(!a.is_reserved());
    assert!(!stuck.is_reserved());
    assert!(a.last_use_fence().is_none());
    for pt in h.vm.page_tables() {
        assert!(!pt.is_reserved());
    }

    // The failed attempt moved nothing, so it charged nothing.
    let threshold_after = h.device.budget().threshold(h.device.placement());
    assert_eq!(threshold_before, threshold_after);
}

#[test]
fn shared_buffer_contention_surfaces_retry_and_succeeds_after_release() {
    let h = Harness::new();
    let (ha, a) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);

    // Another submitter mid-admission holds the buffer's reservation.
    let other = ReservationTicket::acquire(&[a.clone()]).unwrap();

    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(ha, RESOURCE_FLAG_WRITE)])
        .build();
    let err = submit(&h.device, &h.vm, &payload).unwrap_err();
    assert_eq!(
        err,
        SubmitError::Retry {
            reason: RetryReason::TicketContended
        }
    );
    assert!(err.is_transient());
    // The loser backed off completely; the shared buffer is never
    // half-validated or tokened.
    assert!(other.holds(&a));
    assert!(a.last_use_fence().is_none());
    for pt in h.vm.page_tables() {
        assert!(!pt.is_reserved());
    }

    other.release_backoff();
    let seq = submit(&h.device, &h.vm, &payload).unwrap();
    let job = h.finish_next();
    assert_eq!(job.sequence, seq);
    assert!(a.last_use_fence().unwrap().same(&job.fence));
}

#[test]
fn eviction_scenario_through_the_full_admission_path() {
    // VRAM holds the address space's page table plus exactly one buffer.
    let h = Harness::with_placement(RamPlacementConfig {
        vram_bytes: 8192,
        visible_vram_bytes: 8192,
        gtt_bytes: 1 << 20,
    });

    // C: movable occupant of VRAM, placed by an earlier submission.
    let (h_c, c) = h.buffer(4096, MemDomain::VRAM, MemDomain::VRAM | MemDomain::GTT);
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(h_c, 0)])
        .build();
    submit(&h.device, &h.vm, &payload).unwrap();
    h.finish_next();
    assert_eq!(c.current_placement().unwrap().domain, MemDomain::VRAM);

    // A needs VRAM; C gets relocated to make room.
    let (h_a, a) = h.buffer(4096, MemDomain::VRAM, MemDomain::VRAM);
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(h_a, RESOURCE_FLAG_WRITE), (h_c, 0)])
        .build();
    let seq = submit(&h.device, &h.vm, &payload).unwrap();

    assert_eq!(a.current_placement().unwrap().domain, MemDomain::VRAM);
    assert_eq!(c.current_placement().unwrap().domain, MemDomain::GTT);

    let job = h.finish_next();
    assert_eq!(job.sequence, seq);
    // Both ended up tokened by the submission that reserved them.
    assert!(a.last_use_fence().unwrap().same(&job.fence));
    assert!(c.last_use_fence().unwrap().same(&job.fence));
}

#[test]
fn eviction_fails_with_exhaustion_when_the_occupant_is_pinned() {
    // VRAM holds the address space's page table plus exactly one buffer.
    let h = Harness::with_placement(RamPlacementConfig {
        vram_bytes: 8192,
        visible_vram_bytes: 8192,
        gtt_bytes: 1 << 20,
    });

    let (h_b, b) = h.buffer(4096, MemDomain::VRAM, MemDomain::VRAM | MemDomain::GTT);
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(h_b, 0)])
        .build();
    submit(&h.device, &h.vm, &payload).unwrap();
    h.finish_next();
    b.pin();

    let (h_a, _a) = h.buffer(4096, MemDomain::VRAM, MemDomain::VRAM);
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(h_a, RESOURCE_FLAG_WRITE), (h_b, 0)])
        .build();
    assert_eq!(
        submit(&h.device, &h.vm, &payload).unwrap_err(),
        SubmitError::OutOfMemory
    );
    b.unpin();
}

#[test]
fn poisoned_context_rejects_submissions_terminally() {
    let h = Harness::new();
    let (ha, _a) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);
    h.ctx.poison();

    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(ha, 0)])
        .build();
    let err = submit(&h.device, &h.vm, &payload).unwrap_err();
    assert_eq!(err, SubmitError::ContextPoisoned);
    assert!(!err.is_transient());
}

#[test]
fn explicit_dependency_orders_jobs_across_contexts() {
    let h = Harness::new();
    let (producer_id, _producer) = (h.ctx_id, h.ctx.clone());
    let (consumer_id, _consumer) = h.device.create_context();
    let consumer_vm = talon_submit::AddressSpace::new(1, 4096);

    let (ha, _a) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);
    let payload = SubmissionBuilder::new(producer_id)
        .work(QUEUE, 0, 0)
        .resources(&[(ha, RESOURCE_FLAG_WRITE)])
        .build();
    let producer_seq = submit(&h.device, &h.vm, &payload).unwrap();
    let producer_job = h.queue.pop().unwrap();

    let (hb, _b) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);
    let payload = SubmissionBuilder::new(consumer_id)
        .work(QUEUE, 0, 0)
        .resources(&[(hb, 0)])
        .dep(producer_id, QUEUE, producer_seq)
        .build();
    submit(&h.device, &consumer_vm, &payload).unwrap();
    let consumer_job = h.queue.pop().unwrap();

    assert!(consumer_job
        .deps
        .fences()
        .iter()
        .any(|f| f.same(&producer_job.fence)));
    assert!(!consumer_job.deps.all_signaled());
    producer_job.fence.signal();
    assert!(consumer_job.deps.all_signaled());
    consumer_job.fence.signal();
}

#[test]
fn sync_objects_chain_submissions_together() {
    let h = Harness::new();
    let (out_handle, out_obj) = h.device.sync_objs().create();
    let (ha, _a) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);

    // First submission signals the sync object on commit.
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(ha, RESOURCE_FLAG_WRITE)])
        .sync_out(out_handle)
        .build();
    submit(&h.device, &h.vm, &payload).unwrap();
    let first = h.queue.pop().unwrap();
    assert!(out_obj.current().unwrap().same(&first.fence));

    // Second submission waits on the object's current fence.
    let (hb, _b) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);
    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(hb, 0)])
        .sync_in(out_handle)
        .build();
    submit(&h.device, &h.vm, &payload).unwrap();
    let second = h.queue.pop().unwrap();
    assert!(second.deps.fences().iter().any(|f| f.same(&first.fence)));

    first.fence.signal();
    second.fence.signal();
}

#[test]
fn user_fence_target_rides_along_on_the_job() {
    let h = Harness::new();
    let (ha, _a) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);
    let (huf, uf) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);

    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(ha, 0)])
        .user_fence(huf, 16)
        .build();
    submit(&h.device, &h.vm, &payload).unwrap();

    let job = h.finish_next();
    let (fence_bo, offset) = job.user_fence.as_ref().unwrap();
    assert_eq!(fence_bo.id(), uf.id());
    assert_eq!(*offset, 16);
    // The user-fence target is reserved with everything else, so it is
    // tokened like any other buffer.
    assert!(uf.last_use_fence().unwrap().same(&job.fence));
}

#[test]
fn queries_resolve_submissions_end_to_end() {
    let h = Harness::new();
    let (ha, _a) = h.buffer(4096, MemDomain::GTT, MemDomain::GTT);

    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(ha, 0)])
        .build();
    let pending_seq = submit(&h.device, &h.vm, &payload).unwrap();
    let pending_point = FencePoint {
        context_id: h.ctx_id,
        queue: QUEUE,
        sequence: pending_seq,
    };

    assert_eq!(
        wait_one(&h.device, &pending_point, Duration::from_millis(5)).unwrap(),
        QueryStatus::TimedOut
    );

    let payload = SubmissionBuilder::new(h.ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(ha, 0)])
        .build();
    let done_seq = submit(&h.device, &h.vm, &payload).unwrap();
    let done_point = FencePoint {
        context_id: h.ctx_id,
        queue: QUEUE,
        sequence: done_seq,
    };

    // Complete the first job, then the second.
    h.finish_next();
    h.finish_next();

    assert_eq!(
        wait_one(&h.device, &done_point, Duration::ZERO).unwrap(),
        QueryStatus::Complete { error: None }
    );
    let (status, first) = wait_any(
        &h.device,
        &[pending_point, done_point],
        Duration::from_secs(5),
    )
    .unwrap();
    assert!(status.is_complete());
    assert_eq!(first, Some(0));
}

/// Placement wrapper that simulates host paging racing the admission: the
/// first validate call touching the target buffer invalidates its user
/// pages mid-flight.
struct PagingRace {
    inner: RamPlacement,
    target: Mutex<Option<BufferRef>>,
}

impl PlacementBackend for PagingRace {
    fn validate(&self, bo: &Buffer, domains: MemDomain) -> Result<MoveStats, PlacementError> {
        let mut target = self.target.lock().unwrap();
        if let Some(t) = target.as_ref() {
            if t.id() == bo.id() {
                t.invalidate_user_pages();
                *target = None;
            }
        }
        drop(target);
        self.inner.validate(bo, domains)
    }

    fn domain_stats(&self, domain: MemDomain) -> DomainStats {
        self.inner.domain_stats(domain)
    }

    fn visible_vram_stats(&self) -> Option<DomainStats> {
        self.inner.visible_vram_stats()
    }
}

#[test]
fn user_page_invalidation_between_validation_and_commit_is_a_retry() {
    let placement = Arc::new(PagingRace {
        inner: RamPlacement::new(RamPlacementConfig::default()),
        target: Mutex::new(None),
    });
    let device = Device::new(Config::default(), placement.clone());
    let queue = FifoQueue::new();
    device.register_queue(QUEUE, queue.clone());
    let (ctx_id, _ctx) = device.create_context();
    let vm = talon_submit::AddressSpace::new(0, 4096);

    let mut desc =
        talon_mem::BufferDesc::new(4096, MemDomain::GTT, MemDomain::GTT | MemDomain::CPU);
    desc.user_backed = true;
    let (handle, bo) = device.buffers().create(desc);
    *placement.target.lock().unwrap() = Some(bo.clone());

    let payload = SubmissionBuilder::new(ctx_id)
        .work(QUEUE, 0, 0)
        .resources(&[(handle, RESOURCE_FLAG_WRITE)])
        .build();

    let err = submit(&device, &vm, &payload).unwrap_err();
    assert_eq!(
        err,
        SubmitError::Retry {
            reason: RetryReason::UserPagesInvalidated
        }
    );
    assert!(!bo.is_reserved());
    assert!(bo.last_use_fence().is_none());

    // The restart captures the new pages and commits.
    let seq = submit(&device, &vm, &payload).unwrap();
    let job = queue.pop().unwrap();
    assert_eq!(job.sequence, seq);
    assert!(bo.last_use_fence().unwrap().same(&job.fence));
}
