//! Out-of-band fence queries: has submission N on engine E completed?

use std::time::{Duration, Instant};

use talon_sync::{self as sync, Fence, FenceError, WaitStatus};

use crate::context::QueueSelector;
use crate::device::Device;
use crate::error::Result;

/// Names one submission for querying: context, engine queue, sequence
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencePoint {
    pub context_id: u32,
    pub queue: QueueSelector,
    pub sequence: u64,
}

/// Outcome of a bounded completion query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// The work completed (or had already retired). `error` carries the
    /// job's terminal error if it failed.
    Complete { error: Option<FenceError> },
    TimedOut,
}

impl QueryStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, QueryStatus::Complete { .. })
    }
}

fn resolve(device: &Device, point: &FencePoint) -> Result<Option<Fence>> {
    let ctx = device.context(point.context_id)?;
    // The engine selector must name a live queue even when the fence has
    // already retired.
    device.queue(point.queue)?;
    ctx.get_fence(point.queue, point.sequence)
}

/// Wait for one submission to complete, up to `timeout`.
///
/// A sequence the history window has slid past counts as already
/// complete.
pub fn wait_one(device: &Device, point: &FencePoint, timeout: Duration) -> Result<QueryStatus> {
    match resolve(device, point)? {
        None => Ok(QueryStatus::Complete { error: None }),
        Some(fence) => match fence.wait_timeout(timeout) {
            WaitStatus::Signaled { error } => Ok(QueryStatus::Complete { error }),
            WaitStatus::TimedOut => Ok(QueryStatus::TimedOut),
        },
    }
}

/// Wait for every listed submission, sharing one deadline.
///
/// Waits sequentially and short-circuits on the first entry still pending
/// at the deadline; the aggregate is complete only if every entry
/// signaled. The first terminal error encountered is carried in the
/// aggregate status.
pub fn wait_all(device: &Device, points: &[FencePoint], timeout: Duration) -> Result<QueryStatus> {
    let deadline = Instant::now() + timeout;
    for point in points {
        let Some(fence) = resolve(device, point)? else {
            continue;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match fence.wait_timeout(remaining) {
            WaitStatus::Signaled { error: None } => {}
            WaitStatus::Signaled { error } => return Ok(QueryStatus::Complete { error }),
            WaitStatus::TimedOut => return Ok(QueryStatus::TimedOut),
        }
    }
    Ok(QueryStatus::Complete { error: None })
}

/// Wait until any listed submission completes; returns the index of the
/// first entry observed signaled.
///
/// An entry that has already retired (or already signaled) wins
/// immediately with zero wait. Tie-breaking among concurrently signaling
/// entries follows the waiting primitive's iteration order and is not
/// externally meaningful.
pub fn wait_any(
    device: &Device,
    points: &[FencePoint],
    timeout: Duration,
) -> Result<(QueryStatus, Option<usize>)> {
    let mut fences = Vec::with_capacity(points.len());
    for (index, point) in points.iter().enumerate() {
        match resolve(device, point)? {
            // Already retired: nothing to wait for.
            None => return Ok((QueryStatus::Complete { error: None }, Some(index))),
            Some(fence) => fences.push(fence),
        }
    }

    match sync::wait_any(&fences, timeout) {
        (WaitStatus::Signaled { error }, first) => {
            Ok((QueryStatus::Complete { error }, first))
        }
        (WaitStatus::TimedOut, _) => Ok((QueryStatus::TimedOut, None)),
    }
}

/// Export a submission's completion token as a fresh sync object handle.
///
/// A retired sequence exports an empty sync object, which contributes no
/// dependency anywhere it is waited on, the same observable behavior as
/// an already-signaled fence.
pub fn fence_to_syncobj(device: &Device, point: &FencePoint) -> Result<u32> {
    let fence = resolve(device, point)?;
    let (handle, obj) = device.sync_objs().create();
    if let Some(fence) = fence {
        obj.attach(fence);
    }
    Ok(handle)
}
