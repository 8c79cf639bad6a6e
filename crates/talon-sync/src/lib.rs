//! Completion tokens and sync objects for the talon GPU driver stack.
//!
//! A [`Fence`] is a single-assignment future: it is created unsignaled when a
//! job is committed to an engine queue and signaled exactly once when the
//! GPU work finishes (possibly with a terminal error). Fences are shared by
//! reference count between the submitter, every buffer the job touched and
//! any sync objects the submission asked to be signaled; the token is
//! destroyed only when the last holder drops it.
//!
//! A [`SyncObj`] is a named, re-bindable slot holding the most recent fence
//! attached by any submission. It is the cross-process synchronization
//! currency: submissions can wait on a sync object's current fence and
//! attach their own completion fence on commit.

mod fence;
mod syncobj;

pub use fence::{wait_any, Fence, FenceError, WaitStatus};
pub use syncobj::{SyncObj, SyncObjRef, SyncObjTable};
