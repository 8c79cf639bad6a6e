//! The admission path: decode, reserve, resolve, commit.

use std::sync::Arc;

use tracing::{debug, warn};

use talon_sync::{Fence, SyncObjRef};

use crate::chunk::{decode_submission, DecodedSubmission};
use crate::context::{Context, JobSink, QueueSelector};
use crate::deps::resolve_dependencies;
use crate::device::Device;
use crate::error::{Result, RetryReason, SubmitError};
use crate::job::{DepSet, Job, JobBuffer, JobWork};
use crate::reserve::{reserve_and_validate, ValidatedReservation};
use crate::vm::AddressSpace;

/// Admit one submission.
///
/// Phases: decode the untrusted payload, reserve and validate the full
/// buffer set, resolve dependencies, then commit the job to its engine
/// queue. Returns the per-context sequence handle the caller can wait on
/// through the fence query service.
///
/// A [`SubmitError::Retry`] result means the admission raced with another
/// submitter or with host paging; the caller restarts the whole call. Any
/// error leaves no buffer reserved and no token attached.
pub fn submit(device: &Device, vm: &AddressSpace, payload: &[u8]) -> Result<u64> {
    let decoded = decode_submission(payload, device.buffers())?;

    let ctx = device.context(decoded.context_id)?;
    if ctx.is_poisoned() {
        return Err(SubmitError::ContextPoisoned);
    }
    let queue = decoded.queue();
    let sink = device.queue(queue)?;

    let reservation = reserve_and_validate(device, vm, &decoded)?;

    // From here on, any error path drops `reservation`, whose ticket
    // backs off on drop: no resource stays reserved.
    let (deps, post) = resolve_dependencies(device, &ctx, vm, &decoded, &reservation)?;

    commit(device, &ctx, queue, sink, decoded, reservation, deps, post)
}

/// Two-phase commit.
///
/// Phase 1 finalizes the job against its target queue: the per-context
/// sequence is allocated and the completion token created. Phase 2 runs
/// under the device's exclusive commit section: recheck user-backed
/// pages, verify the reservation still holds every buffer, publish the
/// token (context history, output sync objects), hand the job to the
/// queue, and attach the token to every reserved buffer as the ticket is
/// released. The recheck and the release are the only points where the
/// buffers become visible to other submitters with the new token
/// attached.
#[allow(clippy::too_many_arguments)]
fn commit(
    device: &Device,
    ctx: &Context,
    queue: QueueSelector,
    sink: Arc<dyn JobSink>,
    decoded: DecodedSubmission,
    reservation: ValidatedReservation,
    deps: DepSet,
    post: Vec<SyncObjRef>,
) -> Result<u64> {
    let sequence = ctx.alloc_sequence(queue);
    let fence = Fence::new(sequence);

    let job = Job {
        context_id: ctx.id(),
        queue,
        sequence,
        work: decoded
            .work
            .iter()
            .map(|w| JobWork {
                cmd_va: w.cmd_va,
                cmd_size_bytes: w.cmd_size_bytes,
                flags: w.flags,
            })
            .collect(),
        deps,
        fence: fence.clone(),
        buffers: reservation
            .entries
            .iter()
            .map(|e| JobBuffer {
                bo: e.bo.clone(),
                write: e.write,
            })
            .collect(),
        user_fence: decoded.user_fence.map(|uf| (uf.bo, uf.offset)),
    };

    let _commit = device.commit_lock.lock().unwrap();

    // If host paging invalidated any user-backed buffer after validation,
    // the bindings built during reservation are stale. Abort with the
    // retry outcome; the caller restarts from decoding.
    for entry in &reservation.entries {
        if let Some(captured) = entry.captured_pages {
            if entry.bo.user_pages_version() != Some(captured) {
                warn!(
                    context = ctx.id(),
                    bo = entry.bo.id(),
                    "user pages invalidated between validation and commit"
                );
                return Err(SubmitError::Retry {
                    reason: RetryReason::UserPagesInvalidated,
                });
            }
        }
    }

    // Every buffer in the job's set must still be locked by this
    // submission's ticket.
    for entry in &reservation.entries {
        if !reservation.ticket.holds(&entry.bo) {
            return Err(SubmitError::NotReserved {
                id: entry.bo.id(),
            });
        }
    }

    ctx.record_fence(queue, &fence);

    for obj in &post {
        obj.attach(fence.clone());
    }

    sink.enqueue(job);

    reservation.ticket.release_and_fence(&fence);

    debug!(context = ctx.id(), sequence, "submission committed");
    Ok(sequence)
}
