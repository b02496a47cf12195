//! Scheduler: seeds the queue, runs the pool, collects reports.

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use affinity_core::{JobId, RemoteStepExecutor, SessionProbe, WorkerId};
use affinity_session::SessionRegistry;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    config::SchedulerConfig,
    job::{Job, JobSpec},
    queue::JobQueue,
    report::RunReport,
    worker::{Shared, Worker},
};

/// Scheduler error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Worker pool must have at least one worker")]
    NoWorkers,
    #[error("Invalid job #{index}: {reason}")]
    InvalidJob { index: usize, reason: String },
}

/// Runs batches of multi-step jobs on a fixed worker pool.
///
/// All state (session registry, job ids, per-run queue) is owned by the
/// scheduler value, so independent schedulers do not interfere.
pub struct Scheduler {
    executor: Arc<dyn RemoteStepExecutor>,
    registry: Arc<SessionRegistry>,
    config: SchedulerConfig,
    next_id: AtomicU64,
}

impl Scheduler {
    #[must_use]
    pub fn new(executor: Arc<dyn RemoteStepExecutor>, config: SchedulerConfig) -> Self {
        Self {
            executor,
            registry: Arc::new(SessionRegistry::new()),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Registry of in-flight sessions.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Liveness probe for the remote side.
    #[must_use]
    pub fn probe(&self) -> Arc<dyn SessionProbe> {
        self.registry.clone()
    }

    /// Run `specs` to completion.
    ///
    /// Returns once every worker has retired, which happens only after the
    /// queue drained and stayed empty for the idle timeout.
    ///
    /// # Errors
    /// Returns error if the pool is empty or a spec is invalid; no job is
    /// started in that case.
    pub async fn run(&self, specs: Vec<JobSpec>) -> Result<RunReport, SchedulerError> {
        self.run_until(specs, std::future::pending()).await
    }

    /// Run `specs` until they complete or `shutdown` resolves.
    ///
    /// On shutdown, the queue is closed and the sessions of queued jobs are
    /// released. Workers retire at their next dequeue without interrupting
    /// a step in progress; a job whose step was running is released by its
    /// worker once the step returns. The report lists every job that was
    /// not finalized as abandoned.
    ///
    /// # Errors
    /// Returns error if the pool is empty or a spec is invalid.
    pub async fn run_until<F>(
        &self,
        specs: Vec<JobSpec>,
        shutdown: F,
    ) -> Result<RunReport, SchedulerError>
    where
        F: Future<Output = ()>,
    {
        if self.config.workers == 0 {
            return Err(SchedulerError::NoWorkers);
        }
        for (index, spec) in specs.iter().enumerate() {
            spec.validate()
                .map_err(|reason| SchedulerError::InvalidJob { index, reason })?;
        }

        let jobs: Vec<Job> = specs
            .into_iter()
            .map(|spec| Job::new(self.next_job_id(), spec))
            .collect();
        let seeded: Vec<JobId> = jobs.iter().map(Job::id).collect();
        let shared = Arc::new(Shared::new(
            jobs.into_iter().collect::<JobQueue>(),
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            self.config.idle_timeout,
        ));

        tracing::info!(
            jobs = seeded.len(),
            workers = self.config.workers,
            "Starting scheduler run"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        for index in 0..self.config.workers {
            let worker = Worker::new(WorkerId(index), Arc::clone(&shared), tx.clone());
            workers.spawn(worker.run());
        }
        drop(tx);

        let mut summaries = Vec::with_capacity(self.config.workers);
        let interrupted = {
            let all_retired = async {
                while let Some(joined) = workers.join_next().await {
                    match joined {
                        Ok(summary) => summaries.push(summary),
                        Err(e) => tracing::error!("Worker task failed: {e}"),
                    }
                }
            };
            tokio::select! {
                () = all_retired => false,
                () = shutdown => true,
            }
        };

        if interrupted {
            tracing::warn!(
                active_workers = shared.active_workers.load(Ordering::SeqCst),
                "Scheduler run interrupted"
            );
            let dropped = shared.stop();
            tracing::debug!(queued = dropped.len(), "Dropped queued jobs");
            workers.detach_all();
        }
        summaries.sort_by_key(|summary| summary.worker);

        let mut jobs = Vec::with_capacity(seeded.len());
        while let Ok(report) = rx.try_recv() {
            jobs.push(report);
        }
        jobs.sort_by_key(|report| report.id);

        let finalized: HashSet<JobId> = jobs.iter().map(|report| report.id).collect();
        let abandoned: Vec<JobId> = seeded
            .into_iter()
            .filter(|id| !finalized.contains(id))
            .collect();

        tracing::info!(
            finalized = jobs.len(),
            abandoned = abandoned.len(),
            "Scheduler run finished"
        );

        Ok(RunReport {
            jobs,
            abandoned,
            workers: summaries,
            interrupted,
        })
    }

    fn next_job_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use affinity_core::StepDescriptor;
    use affinity_executor::{CounterExecutor, INCREMENT_COUNTER};

    use super::*;
    use crate::report::WorkerSummary;

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::new(
            Arc::new(CounterExecutor::new()),
            SchedulerConfig::default()
                .with_workers(workers)
                .with_idle_timeout(Duration::from_millis(30)),
        )
    }

    #[tokio::test]
    async fn test_rejects_empty_pool() {
        let result = scheduler(0).run(Vec::new()).await;
        assert_eq!(result, Err(SchedulerError::NoWorkers));
    }

    #[tokio::test]
    async fn test_rejects_zero_budget_before_starting() {
        let scheduler = scheduler(1);
        let specs = vec![
            JobSpec::stateless(StepDescriptor::new(INCREMENT_COUNTER), 2),
            JobSpec::stateless(StepDescriptor::new(INCREMENT_COUNTER), 0),
        ];
        let result = scheduler.run(specs).await;
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidJob { index: 1, .. })
        ));
        assert!(scheduler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_retires_workers() {
        let report = scheduler(2).run(Vec::new()).await.unwrap();
        assert!(report.jobs.is_empty());
        assert!(!report.interrupted);
        assert_eq!(
            report.workers,
            vec![WorkerSummary::new(WorkerId(0)), WorkerSummary::new(WorkerId(1))]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_job_ids_continue_across_runs() {
        let scheduler = scheduler(1);
        let spec = JobSpec::stateless(StepDescriptor::new(INCREMENT_COUNTER), 1);

        let first = scheduler.run(vec![spec.clone()]).await.unwrap();
        let second = scheduler.run(vec![spec]).await.unwrap();

        assert_eq!(first.jobs[0].id, JobId(1));
        assert_eq!(second.jobs[0].id, JobId(2));
    }
}
