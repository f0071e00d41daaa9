//! Thread-safe priority queue with anti-starvation aging
//!
//! Ordering contract: effective priority (declared priority plus accumulated
//! aging boost) strictly dominates; equal effective priorities break by
//! earlier enqueue. A monotonic sequence number keeps FIFO exact even when
//! two enqueues land on the same timestamp tick.

use chrono::{DateTime, Utc};
use sched_core::{Error, Job, JobId, Result};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

/// Ordering key for a queued job
///
/// The smallest key is the head of the queue. The job id rides along for
/// lookups and does not participate in ordering; `seq` is unique per entry.
#[derive(Debug, Clone)]
struct QueueKey {
    effective_priority: i32,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    job_id: JobId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher effective priority first, then FIFO.
        other
            .effective_priority
            .cmp(&self.effective_priority)
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
            && self.effective_priority == other.effective_priority
            && self.enqueued_at == other.enqueued_at
    }
}

impl Eq for QueueKey {}

#[derive(Debug, Clone)]
struct QueueEntry {
    job: Job,
    enqueued_at: DateTime<Utc>,
    aging_boost: i32,
    seq: u64,
}

impl QueueEntry {
    fn key(&self) -> QueueKey {
        QueueKey {
            effective_priority: self.job.priority.saturating_add(self.aging_boost),
            enqueued_at: self.enqueued_at,
            seq: self.seq,
            job_id: self.job.id.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: HashMap<JobId, QueueEntry>,
    order: BTreeSet<QueueKey>,
    next_seq: u64,
}

/// The scheduling queue
///
/// All mutating operations serialize on the write half of one lock; readers
/// share the read half. No I/O happens under the lock.
#[derive(Debug)]
pub struct JobQueue {
    inner: RwLock<QueueInner>,
    capacity: usize,
}

impl JobQueue {
    /// Create a queue bounded at `capacity` jobs
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(QueueInner::default()),
            capacity,
        }
    }

    /// Add a job to the queue
    ///
    /// Fails with queue-full at capacity and duplicate-in-queue when the job
    /// id is already present. The aging boost starts at zero.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        if inner.entries.len() >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }
        if inner.entries.contains_key(&job.id) {
            return Err(Error::DuplicateJob {
                job_id: job.id.clone(),
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = QueueEntry {
            enqueued_at: Utc::now(),
            aging_boost: 0,
            seq,
            job,
        };
        inner.order.insert(entry.key());
        inner.entries.insert(entry.job.id.clone(), entry);
        Ok(())
    }

    /// Remove and return the highest-priority job
    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.write().unwrap();

        let head = inner.order.iter().next().cloned()?;
        inner.order.remove(&head);
        inner.entries.remove(&head.job_id).map(|e| e.job)
    }

    /// Return the highest-priority job without removing it
    pub fn peek(&self) -> Option<Job> {
        let inner = self.inner.read().unwrap();

        let head = inner.order.iter().next()?;
        inner.entries.get(&head.job_id).map(|e| e.job.clone())
    }

    /// Remove a specific job from the queue
    pub fn remove(&self, job_id: &JobId) -> bool {
        let mut inner = self.inner.write().unwrap();

        match inner.entries.remove(job_id) {
            Some(entry) => {
                inner.order.remove(&entry.key());
                true
            }
            None => false,
        }
    }

    /// Return a queued job by id without removing it
    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        let inner = self.inner.read().unwrap();
        inner.entries.get(job_id).map(|e| e.job.clone())
    }

    /// 1-indexed rank of a job in the ordering, or None if absent
    pub fn position(&self, job_id: &JobId) -> Option<usize> {
        let inner = self.inner.read().unwrap();

        inner.entries.get(job_id)?;
        inner
            .order
            .iter()
            .position(|k| &k.job_id == job_id)
            .map(|p| p + 1)
    }

    /// Snapshot of all queued jobs in queue order
    pub fn list(&self) -> Vec<Job> {
        let inner = self.inner.read().unwrap();

        inner
            .order
            .iter()
            .filter_map(|key| inner.entries.get(&key.job_id).map(|e| e.job.clone()))
            .collect()
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    /// Whether the queue holds no jobs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued job
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Boost jobs that have waited longer than `threshold`
    ///
    /// Each qualifying entry's boost grows by `boost`, saturating at `cap`
    /// when one is set. The boost never decreases while the job stays
    /// queued, so effective priority is monotonic.
    pub fn apply_aging(&self, boost: i32, threshold: Duration, cap: Option<i32>) {
        if boost <= 0 {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();

        let aged: Vec<JobId> = inner
            .entries
            .values()
            .filter(|e| (now - e.enqueued_at).to_std().unwrap_or(Duration::ZERO) > threshold)
            .map(|e| e.job.id.clone())
            .collect();

        for id in aged {
            let Some(entry) = inner.entries.get(&id) else {
                continue;
            };
            let old_key = entry.key();
            let mut raised = entry.aging_boost.saturating_add(boost);
            if let Some(cap) = cap {
                raised = raised.min(cap);
            }
            inner.order.remove(&old_key);

            let entry = inner.entries.get_mut(&id).unwrap();
            entry.aging_boost = raised;
            let new_key = entry.key();
            inner.order.insert(new_key);
        }
    }

    /// Effective priority of a queued job, or None if absent
    pub fn effective_priority(&self, job_id: &JobId) -> Option<i32> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .get(job_id)
            .map(|e| e.job.priority.saturating_add(e.aging_boost))
    }
}
