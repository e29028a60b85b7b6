//! Priority queue for the Waiting Room.
//!
//! Jobs are ordered by priority (lower values scheduled sooner), then by
//! enqueue order (FIFO within the same priority level). The queue supports
//! removal by job identity so a cancelled query can unschedule its jobs
//! while they are still waiting.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use super::job::{JobId, WaitingJob};

/// Job scheduling priority. Lower values are scheduled sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Fixed priority of production resample jobs.
    pub const PRODUCTION: Priority = Priority(1);

    /// Priority of cache-file computation jobs.
    pub const COMPUTE: Priority = Priority(2);

    /// Creates a priority with the given value.
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    /// The numeric priority value.
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

/// Global sequence counter for FIFO ordering within priority levels.
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A waiting job plus the metadata the queue orders by.
struct QueuedJob {
    job: WaitingJob,
    sequence: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse both comparisons so the lowest
        // priority value pops first and ties pop in arrival order.
        match other.job.priority.cmp(&self.job.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Priority queue of waiting jobs.
///
/// Not thread-safe; owned exclusively by the Waiting Room's message loop.
#[derive(Default)]
pub struct JobQueue {
    heap: BinaryHeap<QueuedJob>,
}

impl JobQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a job.
    pub fn push(&mut self, job: WaitingJob) {
        self.heap.push(QueuedJob {
            job,
            sequence: next_sequence(),
        });
    }

    /// Removes and returns the next job to schedule.
    pub fn pop(&mut self) -> Option<WaitingJob> {
        self.heap.pop().map(|q| q.job)
    }

    /// Removes a job by identity.
    ///
    /// Returns the removed job, or `None` when no job with that identity
    /// is waiting (it was already promoted or never scheduled).
    pub fn remove(&mut self, id: &JobId) -> Option<WaitingJob> {
        let mut removed = None;
        let remaining: Vec<_> = self
            .heap
            .drain()
            .filter_map(|q| {
                if removed.is_none() && q.job.id == *id {
                    removed = Some(q.job);
                    None
                } else {
                    Some(q)
                }
            })
            .collect();
        self.heap = BinaryHeap::from(remaining);
        removed
    }

    /// Number of waiting jobs.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true when no jobs are waiting.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("len", &self.heap.len()).finish()
    }
}
