use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Terminal error carried by a signaled fence.
///
/// Once a fence signals with an error the error is immutable and is
/// propagated to every waiter, including late ones.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FenceError {
    #[error("job execution faulted: {0}")]
    JobFaulted(&'static str),

    #[error("job skipped: submitting context was poisoned")]
    ContextPoisoned,
}

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// The fence signaled within the timeout. `error` carries the job's
    /// terminal error, if it failed.
    Signaled { error: Option<FenceError> },
    /// The timeout elapsed before the fence signaled.
    TimedOut,
}

impl WaitStatus {
    pub fn is_signaled(&self) -> bool {
        matches!(self, WaitStatus::Signaled { .. })
    }
}

#[derive(Debug, Default)]
struct AnyWaitState {
    first: Mutex<Option<usize>>,
    cond: Condvar,
}

#[derive(Debug)]
struct FenceState {
    /// `None` until signaled; then `Some(error)` forever.
    result: Option<Option<FenceError>>,
    /// Multi-fence waiters registered by [`wait_any`]. Entries are weak so
    /// an abandoned wait does not pin its bookkeeping to the fence.
    any_waiters: Vec<(usize, Weak<AnyWaitState>)>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<FenceState>,
    cond: Condvar,
    sequence: u64,
}

/// Reference-counted, single-assignment completion token.
///
/// Cloning a `Fence` clones the handle, not the state: all clones observe
/// the same signal. The sequence number is the per-context submission
/// handle the fence was published under and is diagnostic only.
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<Inner>,
}

impl Fence {
    pub fn new(sequence: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FenceState {
                    result: None,
                    any_waiters: Vec::new(),
                }),
                cond: Condvar::new(),
                sequence,
            }),
        }
    }

    /// The per-context sequence this fence was published under.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// Two handles refer to the same underlying fence.
    pub fn same(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.state.lock().unwrap().result.is_some()
    }

    /// Terminal error, if the fence has signaled with one.
    pub fn error(&self) -> Option<FenceError> {
        self.inner
            .state
            .lock()
            .unwrap()
            .result
            .as_ref()
            .and_then(|r| r.clone())
    }

    /// Signal successful completion. A fence signals exactly once.
    pub fn signal(&self) {
        self.complete(None);
    }

    /// Signal completion with a terminal error. A fence signals exactly once.
    pub fn signal_error(&self, error: FenceError) {
        self.complete(Some(error));
    }

    fn complete(&self, error: Option<FenceError>) {
        let waiters = {
            let mut state = self.inner.state.lock().unwrap();
            assert!(state.result.is_none(), "fence signaled twice");
            state.result = Some(error);
            std::mem::take(&mut state.any_waiters)
        };
        self.inner.cond.notify_all();
        for (index, waiter) in waiters {
            let Some(waiter) = waiter.upgrade() else {
                continue;
            };
            let mut first = waiter.first.lock().unwrap();
            if first.is_none() {
                *first = Some(index);
                waiter.cond.notify_all();
            }
        }
    }

    /// Block until the fence signals.
    pub fn wait(&self) -> Option<FenceError> {
        let mut state = self.inner.state.lock().unwrap();
        while state.result.is_none() {
            state = self.inner.cond.wait(state).unwrap();
        }
        state.result.as_ref().and_then(|r| r.clone())
    }

    /// Block until the fence signals or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(error) = state.result.as_ref() {
                return WaitStatus::Signaled {
                    error: error.clone(),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitStatus::TimedOut;
            }
            let (next, res) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if res.timed_out() && state.result.is_none() {
                return WaitStatus::TimedOut;
            }
        }
    }

    /// Register a [`wait_any`] waiter, or record `index` immediately if the
    /// fence has already signaled. Returns true if it recorded immediately.
    fn register_any_waiter(&self, index: usize, waiter: &Arc<AnyWaitState>) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.result.is_some() {
            let mut first = waiter.first.lock().unwrap();
            if first.is_none() {
                *first = Some(index);
            }
            return true;
        }
        state.any_waiters.retain(|(_, w)| w.strong_count() > 0);
        state.any_waiters.push((index, Arc::downgrade(waiter)));
        false
    }
}

/// Wait until any fence in `fences` signals, up to `timeout`.
///
/// Returns the index of the first entry observed signaled. An entry that is
/// already signaled on entry wins immediately with zero wait time; ties
/// between entries signaling concurrently are broken by whichever waiter
/// bookkeeping ran first, which is not externally meaningful.
pub fn wait_any(fences: &[Fence], timeout: Duration) -> (WaitStatus, Option<usize>) {
    // Fast path: slice order decides among already-signaled entries.
    for (index, fence) in fences.iter().enumerate() {
        if fence.is_signaled() {
            return (
                WaitStatus::Signaled {
                    error: fence.error(),
                },
                Some(index),
            );
        }
    }

    let waiter = Arc::new(AnyWaitState::default());
    for (index, fence) in fences.iter().enumerate() {
        if fence.register_any_waiter(index, &waiter) {
            break;
        }
    }

    let deadline = Instant::now() + timeout;
    let mut first = waiter.first.lock().unwrap();
    loop {
        if let Some(index) = *first {
            let error = fences[index].error();
            return (WaitStatus::Signaled { error }, Some(index));
        }
        let now = Instant::now();
        if now >= deadline {
            return (WaitStatus::TimedOut, None);
        }
        let (next, res) = waiter.cond.wait_timeout(first, deadline - now).unwrap();
        first = next;
        if res.timed_out() && first.is_none() {
            return (WaitStatus::TimedOut, None);
        }
    }
}
