//! Shared FIFO of jobs awaiting their next step.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use affinity_core::JobId;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};

use crate::job::Job;

/// The queue was closed; the job was not admitted.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Job queue is closed")]
pub struct QueueClosed;

#[derive(Default)]
struct Slots {
    jobs: VecDeque<Job>,
    closed: bool,
}

/// Thread-safe FIFO with a timed dequeue.
///
/// Admission and requeue both append at the tail, so stalled jobs take
/// turns instead of one job being served repeatedly. Once closed, the queue
/// rejects pushes and every pop returns `None` immediately.
pub struct JobQueue {
    slots: Mutex<Slots>,
    available: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<Job> for JobQueue {
    fn from_iter<I: IntoIterator<Item = Job>>(jobs: I) -> Self {
        Self {
            slots: Mutex::new(Slots {
                jobs: jobs.into_iter().collect(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }
}

impl JobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job at the tail.
    ///
    /// # Errors
    /// Returns `QueueClosed` after [`JobQueue::close`]; the job is dropped.
    pub fn push(&self, job: Job) -> Result<(), QueueClosed> {
        {
            let mut slots = self.lock();
            if slots.closed {
                return Err(QueueClosed);
            }
            slots.jobs.push_back(job);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the head job without waiting.
    pub fn try_pop(&self) -> Option<Job> {
        self.lock().jobs.pop_front()
    }

    /// Take the head job, waiting up to `wait` for one to arrive.
    ///
    /// Returns `None` if the queue stayed empty for the whole window or was
    /// closed.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Job> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.available.notified();
            {
                let mut slots = self.lock();
                if let Some(job) = slots.jobs.pop_front() {
                    return Some(job);
                }
                if slots.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Stop admitting jobs and hand back everything still queued.
    ///
    /// Waiting pops return `None` right away.
    pub fn close(&self) -> Vec<Job> {
        let drained = {
            let mut slots = self.lock();
            slots.closed = true;
            slots.jobs.drain(..).collect()
        };
        self.available.notify_waiters();
        drained
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Ids of queued jobs, head first.
    #[must_use]
    pub fn job_ids(&self) -> Vec<JobId> {
        self.lock().jobs.iter().map(Job::id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }
}
