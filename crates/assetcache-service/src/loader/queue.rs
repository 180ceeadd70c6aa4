use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::state::Job;

struct Queued {
    seq: Reverse<u64>,
    job: Job,
}

impl Queued {
    fn rank(&self) -> (crate::types::Priority, Reverse<u64>) {
        (self.job.priority, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Default)]
struct Heap {
    jobs: BinaryHeap<Queued>,
    next_seq: u64,
}

/// Pending jobs, highest priority first and FIFO within a priority class.
#[derive(Default)]
pub struct JobQueue {
    heap: Mutex<Heap>,
    notify: Notify,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("len", &self.len()).finish()
    }
}

impl JobQueue {
    fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, job: Job) {
        {
            let mut heap = self.lock();
            let seq = Reverse(heap.next_seq);
            heap.next_seq += 1;
            heap.jobs.push(Queued { seq, job });
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Job> {
        self.lock().jobs.pop().map(|queued| queued.job)
    }

    /// Waits for the next job.
    pub async fn pop(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_pop() {
                return job;
            }
            notified.await;
        }
    }

    /// The number of queued jobs, including stale ones.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
