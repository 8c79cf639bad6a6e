//! Command-submission admission path for the talon GPU driver stack.
//!
//! This crate takes a batch of untrusted work descriptors and turns it
//! into a job an engine queue can execute, proving along the way that
//! every buffer the GPU will touch is resident somewhere acceptable:
//!
//! 1. **Decode**: parse and bounds-check the chunk-based payload
//!    ([`decode_submission`]), resolving buffer handles eagerly.
//! 2. **Reserve & validate**: take the all-or-nothing reservation over
//!    the deduplicated buffer union and prove placements under the
//!    migration budget ([`MigrationBudget`]), with last-resort eviction
//!    from the submission's own working set.
//! 3. **Resolve dependencies**: explicit fence points, sync objects, and
//!    the implicit last-use fences of every reserved buffer.
//! 4. **Commit**: allocate the sequence, publish the completion token,
//!    hand the job to the queue ([`JobSink`]), and release the
//!    reservation with the token attached to every buffer.
//!
//! All of this is driven by [`submit`]; completion is queried out-of-band
//! through [`wait_one`]/[`wait_all`]/[`wait_any`]. Failures follow a
//! strict taxonomy ([`SubmitError`]): malformed input fails before
//! touching resources, transient outcomes tell the caller to restart the
//! whole admission, and every failure path rolls back completely.

mod chunk;
mod context;
mod deps;
mod device;
mod error;
mod job;
mod query;
mod reserve;
mod submit;
mod throttle;
mod vm;

pub use chunk::{
    decode_submission, DecodedSubmission, DepEntry, ResourceEntry, SubmissionBuilder, UserFence,
    WorkDesc, CHUNK_DEPS, CHUNK_HEADER_BYTES, CHUNK_RESOURCES, CHUNK_SYNC_IN, CHUNK_SYNC_OUT,
    CHUNK_USER_FENCE, CHUNK_WORK, DEP_ENTRY_BYTES, RESOURCE_ENTRY_BYTES, RESOURCE_FLAG_WRITE,
    RESOURCE_LIST_HEADER_BYTES, SUBMISSION_HEADER_BYTES, SYNC_ENTRY_BYTES, USER_FENCE_BYTES,
    USER_FENCE_PAGE_BYTES, WORK_DESC_BYTES,
};
pub use context::{Context, FifoQueue, JobSink, QueueSelector};
pub use device::{Config, Device};
pub use error::{Result, RetryReason, SubmitError};
pub use job::{DepSet, Job, JobBuffer, JobWork};
pub use query::{fence_to_syncobj, wait_all, wait_any, wait_one, FencePoint, QueryStatus};
pub use submit::submit;
pub use throttle::{Clock, ManualClock, MigrationBudget, MonotonicClock, MoveThreshold};
pub use vm::AddressSpace;
