//! Submitting contexts, engine queues and per-queue fence history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use talon_sync::Fence;

use crate::error::{Result, SubmitError};
use crate::job::Job;

/// Names one engine queue: hardware class, instance of that class, and
/// queue index within the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueSelector {
    pub engine_class: u32,
    pub engine_instance: u32,
    pub index: u32,
}

/// Where finalized jobs go. The execution side (ring encoding, doorbells,
/// completion interrupts) lives behind this trait.
pub trait JobSink: Send + Sync {
    fn enqueue(&self, job: Job);
}

/// Default sink: collects jobs in FIFO order for an external executor to
/// drain. Test harnesses pop jobs and signal their fences by hand.
#[derive(Debug, Default)]
pub struct FifoQueue {
    pending: Mutex<VecDeque<Job>>,
}

impl FifoQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pop(&self) -> Option<Job> {
        self.pending.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

impl JobSink for FifoQueue {
    fn enqueue(&self, job: Job) {
        self.pending.lock().unwrap().push_back(job);
    }
}

#[derive(Debug)]
struct QueueHistory {
    /// Next sequence to hand out; sequences start at 1.
    next_sequence: u64,
    /// Sliding window of recent completion fences, indexed by
    /// `sequence % window`.
    fences: Vec<Option<Fence>>,
}

impl QueueHistory {
    fn new(window: usize) -> Self {
        Self {
            next_sequence: 1,
            fences: vec![None; window],
        }
    }

    fn slot(&self, sequence: u64) -> usize {
        (sequence % self.fences.len() as u64) as usize
    }
}

/// A submitting context: per-queue sequence allocation and fence history,
/// plus the poison latch set when one of its jobs wrecks the engine.
#[derive(Debug)]
pub struct Context {
    id: u32,
    window: usize,
    poisoned: AtomicBool,
    queues: Mutex<HashMap<QueueSelector, QueueHistory>>,
}

impl Context {
    pub(crate) fn new(id: u32, window: usize) -> Self {
        assert!(window >= 2, "fence history window must hold at least two entries");
        Self {
            id,
            window,
            poisoned: AtomicBool::new(false),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Terminal: submissions on a poisoned context fail until the caller
    /// tears it down and creates a fresh one.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Allocate the next sequence number on `queue`.
    pub fn alloc_sequence(&self, queue: QueueSelector) -> u64 {
        let mut queues = self.queues.lock().unwrap();
        let history = queues
            .entry(queue)
            .or_insert_with(|| QueueHistory::new(self.window));
        let sequence = history.next_sequence;
        history.next_sequence += 1;
        sequence
    }

    /// Publish `fence` in the history window under its sequence number.
    ///
    /// The displaced fence one window back is waited on first, which
    /// bounds the number of in-flight submissions per queue to the window
    /// size.
    pub fn record_fence(&self, queue: QueueSelector, fence: &Fence) {
        let displaced = {
            let mut queues = self.queues.lock().unwrap();
            let history = queues
                .entry(queue)
                .or_insert_with(|| QueueHistory::new(self.window));
            let slot = history.slot(fence.sequence());
            history.fences[slot].replace(fence.clone())
        };
        if let Some(displaced) = displaced {
            if !displaced.is_signaled() {
                debug!(
                    context = self.id,
                    displaced = displaced.sequence(),
                    "fence window full, waiting on oldest submission"
                );
                displaced.wait();
            }
        }
    }

    /// The most recently recorded fence on `queue`, if any.
    pub fn recent_fence(&self, queue: QueueSelector) -> Option<Fence> {
        let queues = self.queues.lock().unwrap();
        let history = queues.get(&queue)?;
        let last = history.next_sequence.checked_sub(1)?;
        if last == 0 {
            return None;
        }
        let fence = history.fences[history.slot(last)].clone()?;
        // The slot may hold an older fence if the last allocation never
        // committed.
        (fence.sequence() == last).then_some(fence)
    }

    /// Fetch the completion fence recorded for `sequence`.
    ///
    /// `Ok(None)` means the history has slid past the sequence (or its
    /// submission aborted before commit): the work is treated as already
    /// retired. Asking for a sequence that was never allocated is a
    /// malformed request.
    pub fn get_fence(&self, queue: QueueSelector, sequence: u64) -> Result<Option<Fence>> {
        let queues = self.queues.lock().unwrap();
        let Some(history) = queues.get(&queue) else {
            return Err(SubmitError::FutureSequence { sequence });
        };
        if sequence == 0 || sequence >= history.next_sequence {
            return Err(SubmitError::FutureSequence { sequence });
        }
        let fence = history.fences[history.slot(sequence)].clone();
        Ok(fence.filter(|f| f.sequence() == sequence))
    }
}
