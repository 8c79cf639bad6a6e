use thiserror::Error;

use talon_sync::FenceError;

pub type Result<T> = std::result::Result<T, SubmitError>;

/// Why a submission must be restarted from decoding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Another submission holds part of the buffer set.
    #[error("reservation ticket contended")]
    TicketContended,
    /// Host paging replaced a user-backed buffer's pages between
    /// validation and commit.
    #[error("user-backed pages invalidated during admission")]
    UserPagesInvalidated,
}

/// Admission-path error taxonomy.
///
/// Malformed-input variants fail before any resource is reserved.
/// [`SubmitError::Retry`] is the distinguished transient outcome: the
/// caller restarts the entire admission from decoding, never a single
/// step, because all intermediate state has been discarded. Everything
/// else is a permanent failure for this submission; in every case all
/// partial reservations have been rolled back by the time the error is
/// returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("submission truncated: {0}")]
    Truncated(&'static str),

    #[error("unknown chunk kind {kind:#x}")]
    UnknownChunkKind { kind: u32 },

    #[error("chunk kind {kind:#x} is {len} bytes, need at least {min}")]
    ChunkTooShort { kind: u32, len: u32, min: u32 },

    #[error("chunk kind {kind:#x} length {len} is not a whole number of {entry}-byte entries")]
    ChunkBadArrayLength { kind: u32, len: u32, entry: u32 },

    #[error("duplicate chunk kind {kind:#x}")]
    DuplicateChunk { kind: u32 },

    #[error("submission names no work items")]
    NoWork,

    #[error("work descriptors target more than one queue")]
    QueueMismatch,

    #[error("unknown buffer handle {handle}")]
    UnknownHandle { handle: u32 },

    #[error("unknown sync object handle {handle}")]
    UnknownSyncObj { handle: u32 },

    #[error("unknown context {id}")]
    UnknownContext { id: u32 },

    #[error("no queue for engine class {class} instance {instance} index {index}")]
    UnknownQueue { class: u32, instance: u32, index: u32 },

    #[error("user fence buffer rejected: {reason}")]
    BadUserFence { reason: &'static str },

    #[error("sequence {sequence} has not been submitted on this queue")]
    FutureSequence { sequence: u64 },

    /// No placement possible for some buffer even after eviction.
    #[error("no placement possible for the submission's buffer set")]
    OutOfMemory,

    /// Transient. Restart the whole admission.
    #[error("transient contention: {reason}")]
    Retry { reason: RetryReason },

    /// The context was poisoned by a previously failed job; terminal for
    /// the context.
    #[error("context poisoned by a previously failed job")]
    ContextPoisoned,

    /// Commit-time invariant violation: a buffer in the job's set is not
    /// locked by this submission's ticket. Fatal.
    #[error("buffer {id} not locked by this submission's reservation at commit")]
    NotReserved { id: u64 },

    /// Unrecoverable device error from the placement primitive,
    /// propagated unchanged.
    #[error("device fault: {0}")]
    DeviceFault(&'static str),

    /// A queried job completed with a terminal error.
    #[error("job failed: {0}")]
    JobFailed(#[from] FenceError),
}

impl SubmitError {
    /// Should the caller restart the admission (true) or report failure
    /// (false)?
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Retry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_retry_is_transient() {
        assert!(SubmitError::Retry {
            reason: RetryReason::TicketContended
        }
        .is_transient());
        assert!(SubmitError::Retry {
            reason: RetryReason::UserPagesInvalidated
        }
        .is_transient());
        assert!(!SubmitError::OutOfMemory.is_transient());
        assert!(!SubmitError::ContextPoisoned.is_transient());
        assert!(!SubmitError::DeviceFault("x").is_transient());
    }
}
