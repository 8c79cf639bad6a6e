//! Dependency resolution: turning submission metadata into the set of
//! completion tokens the job must wait on and the sync objects it must
//! signal.

use talon_sync::SyncObjRef;

use crate::chunk::DecodedSubmission;
use crate::context::Context;
use crate::device::Device;
use crate::error::{Result, SubmitError};
use crate::job::DepSet;
use crate::reserve::ValidatedReservation;
use crate::vm::AddressSpace;

/// Build the job's dependency set and post-dependency list.
///
/// The dependency set is the union of:
/// - explicit prerequisites, named as (context, engine, sequence) triples
///   and resolved through the target context's fence history (history
///   that has already slid past a sequence simply contributes nothing);
/// - input sync objects' currently attached fences (an empty slot
///   contributes nothing, an unknown handle fails the submission);
/// - implicitly, every reserved buffer's last-use fence, so prior
///   readers and writers are waited on transparently;
/// - the context's own previous submission on the target queue;
/// - the address space's outstanding page-table update.
///
/// Output sync objects are resolved up front into the post-dependency
/// list (caller order, kept only for tracing); any unresolvable output
/// object aborts the whole submission.
pub(crate) fn resolve_dependencies(
    device: &Device,
    ctx: &Context,
    vm: &AddressSpace,
    decoded: &DecodedSubmission,
    reservation: &ValidatedReservation,
) -> Result<(DepSet, Vec<SyncObjRef>)> {
    let mut deps = DepSet::new();

    for dep in &decoded.deps {
        let dep_ctx = device.context(dep.context_id)?;
        // The engine reference must name a live queue even if the fence
        // itself has retired.
        device.queue(dep.queue)?;
        deps.add_opt(dep_ctx.get_fence(dep.queue, dep.sequence)?);
    }

    for &handle in &decoded.sync_in {
        let obj = device
            .sync_objs()
            .lookup(handle)
            .ok_or(SubmitError::UnknownSyncObj { handle })?;
        deps.add_opt(obj.current());
    }

    let mut post = Vec::with_capacity(decoded.sync_out.len());
    for &handle in &decoded.sync_out {
        post.push(
            device
                .sync_objs()
                .lookup(handle)
                .ok_or(SubmitError::UnknownSyncObj { handle })?,
        );
    }

    for entry in &reservation.entries {
        deps.add_opt(entry.bo.last_use_fence());
    }

    deps.add_opt(ctx.recent_fence(decoded.queue()));
    deps.add_opt(vm.update_mappings(reservation.entries.iter().map(|e| &e.bo)));

    Ok((deps, post))
}
