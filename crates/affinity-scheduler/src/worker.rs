//! Pool worker: one step per dequeue.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use affinity_core::{JobId, RemoteStepExecutor, SessionContext, SessionReference, WorkerId};
use affinity_session::SessionRegistry;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    job::Job,
    queue::JobQueue,
    report::{FailureStage, JobFailure, JobReport, WorkerSummary},
};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Idle,
    Dequeuing,
    Bound,
    Executing,
    Requeue,
    Finalize,
    Retired,
}

/// State shared by all workers of one run.
pub(crate) struct Shared {
    pub(crate) queue: JobQueue,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) executor: Arc<dyn RemoteStepExecutor>,
    pub(crate) idle_timeout: Duration,
    pub(crate) active_workers: AtomicUsize,
}

impl Shared {
    pub(crate) fn new(
        queue: JobQueue,
        registry: Arc<SessionRegistry>,
        executor: Arc<dyn RemoteStepExecutor>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            executor,
            idle_timeout,
            active_workers: AtomicUsize::new(0),
        }
    }

    /// Close the queue so workers retire at their next dequeue, and drop
    /// the sessions of every job still waiting for a step.
    ///
    /// Returns the ids of the dropped jobs.
    pub(crate) fn stop(&self) -> Vec<JobId> {
        self.queue
            .close()
            .iter()
            .map(|job| {
                self.abandon(job.id());
                job.id()
            })
            .collect()
    }

    fn is_stopping(&self) -> bool {
        self.queue.is_closed()
    }

    /// Forget a job that will never be finalized.
    fn abandon(&self, job: JobId) {
        // Jobs that never ran a step have no session yet.
        if let Ok(session) = self.registry.release(job) {
            tracing::debug!(%job, %session, "Released session of abandoned job");
        }
    }
}

/// A pool worker.
///
/// Each iteration dequeues one job, binds the job's session to this worker,
/// runs one step, then either appends the job back to the queue or
/// finalizes it. The worker retires once the queue stays empty for the idle
/// timeout.
pub(crate) struct Worker {
    id: WorkerId,
    shared: Arc<Shared>,
    reports: mpsc::UnboundedSender<JobReport>,
    state: WorkerState,
    summary: WorkerSummary,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        shared: Arc<Shared>,
        reports: mpsc::UnboundedSender<JobReport>,
    ) -> Self {
        shared.active_workers.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            shared,
            reports,
            state: WorkerState::Idle,
            summary: WorkerSummary::new(id),
        }
    }

    /// Drain the queue until it stays empty for the idle timeout.
    pub(crate) async fn run(self) -> WorkerSummary {
        let span = tracing::info_span!("worker", id = self.id.0);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> WorkerSummary {
        loop {
            self.transition(WorkerState::Dequeuing);
            if self.shared.is_stopping() {
                break;
            }
            let Some(job) = self.shared.queue.pop_timeout(self.shared.idle_timeout).await else {
                break;
            };
            if self.shared.is_stopping() {
                self.shared.abandon(job.id());
                break;
            }
            self.process(job).await;
            self.transition(WorkerState::Idle);
        }

        self.transition(WorkerState::Retired);
        let remaining = self.shared.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(
            remaining,
            steps = self.summary.steps,
            finalized = self.summary.finalized,
            "Worker retiring"
        );
        self.summary
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!(from = ?self.state, to = ?next, "Worker state");
        self.state = next;
    }

    async fn process(&mut self, mut job: Job) {
        let shared = Arc::clone(&self.shared);
        let job_id = job.id();
        shared.registry.bind(job_id);

        match shared.registry.enter(job_id, self.id) {
            Ok(binding) => {
                self.transition(WorkerState::Bound);
                tracing::debug!(job = %job.name(), session = %binding.reference(), "Task started");

                self.transition(WorkerState::Executing);
                let stepped = AssertUnwindSafe(
                    job.run_next_step(shared.executor.as_ref(), binding.context()),
                )
                .catch_unwind()
                .await;
                drop(binding);

                if let Err(panic) = stepped {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(job = %job.name(), %message, "Step panicked");
                    job.record_panic(message);
                }
                self.summary.steps += 1;
            }
            Err(err) => {
                tracing::error!(job = %job.name(), %err, "Session binding failed");
                job.record_failure(JobFailure::new(FailureStage::Registry, err));
            }
        }

        if job.is_finished() {
            self.finalize(job).await;
        } else {
            self.transition(WorkerState::Requeue);
            tracing::debug!(job = %job.name(), "Task passivated");
            if shared.queue.push(job).is_err() {
                shared.abandon(job_id);
            }
        }
    }

    async fn finalize(&mut self, mut job: Job) {
        self.transition(WorkerState::Finalize);
        let shared = Arc::clone(&self.shared);

        let session = match shared.registry.release(job.id()) {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(job = %job.name(), %err, "Session registry lost track of job");
                job.record_failure(JobFailure::new(FailureStage::Registry, err));
                job.session()
                    .cloned()
                    .unwrap_or_else(SessionReference::generate)
            }
        };

        let ctx = SessionContext::new(job.id(), self.id, session);
        let report = job.cleanup(shared.executor.as_ref(), &ctx).await;
        self.summary.finalized += 1;

        if self.reports.send(report).is_err() {
            tracing::warn!("Report receiver dropped");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use affinity_core::{ExecutorError, JobId, StepDescriptor, StepOutput};
    use affinity_executor::{CounterExecutor, INCREMENT_COUNTER};
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::job::JobSpec;

    struct PanickingExecutor;

    #[async_trait]
    impl RemoteStepExecutor for PanickingExecutor {
        async fn begin_session(&self, _ctx: &SessionContext) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn end_session(&self, _ctx: &SessionContext) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn execute_step(
            &self,
            _ctx: &SessionContext,
            _step: &StepDescriptor,
        ) -> Result<StepOutput, ExecutorError> {
            panic!("remote layer exploded");
        }
    }

    /// Checks, on every step, that no queued job is also bound to a worker.
    #[derive(Default)]
    struct DisjointnessCheck {
        shared: OnceLock<Arc<Shared>>,
        checks: AtomicUsize,
        violations: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStepExecutor for DisjointnessCheck {
        async fn begin_session(&self, _ctx: &SessionContext) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn end_session(&self, _ctx: &SessionContext) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn execute_step(
            &self,
            ctx: &SessionContext,
            _step: &StepDescriptor,
        ) -> Result<StepOutput, ExecutorError> {
            let shared = self.shared.get().expect("shared attached");
            let queued = shared.queue.job_ids();
            let held = shared.registry.held_jobs();
            if queued.contains(&ctx.job) || queued.iter().any(|id| held.contains(id)) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            self.checks.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Value::Null)
        }
    }

    /// Steps succeed; closing a session panics.
    struct TeardownPanicExecutor;

    #[async_trait]
    impl RemoteStepExecutor for TeardownPanicExecutor {
        async fn begin_session(&self, _ctx: &SessionContext) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn end_session(&self, _ctx: &SessionContext) -> Result<(), ExecutorError> {
            panic!("session close exploded");
        }

        async fn execute_step(
            &self,
            _ctx: &SessionContext,
            _step: &StepDescriptor,
        ) -> Result<StepOutput, ExecutorError> {
            Ok(Value::Null)
        }
    }

    fn shared(executor: Arc<dyn RemoteStepExecutor>) -> Arc<Shared> {
        Arc::new(Shared::new(
            JobQueue::new(),
            Arc::new(SessionRegistry::new()),
            executor,
            Duration::from_millis(20),
        ))
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_retires() {
        let shared = shared(Arc::new(CounterExecutor::new()));
        shared.queue.push(Job::new(
            JobId(1),
            JobSpec::stateful(StepDescriptor::new(INCREMENT_COUNTER), 3),
        ))
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = Worker::new(WorkerId(0), Arc::clone(&shared), tx);
        assert_eq!(shared.active_workers.load(Ordering::SeqCst), 1);
        let summary = worker.run().await;

        assert_eq!(
            summary,
            WorkerSummary {
                worker: WorkerId(0),
                steps: 3,
                finalized: 1
            }
        );
        assert_eq!(shared.active_workers.load(Ordering::SeqCst), 0);
        assert!(shared.registry.is_empty());
        let report = rx.recv().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.steps_executed, 3);
    }

    #[tokio::test]
    async fn test_panic_is_contained_to_job() {
        let shared = shared(Arc::new(PanickingExecutor));
        shared.queue.push(Job::new(
            JobId(1),
            JobSpec::stateless(StepDescriptor::new("work"), 2),
        ))
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = Worker::new(WorkerId(0), Arc::clone(&shared), tx).run().await;

        assert_eq!(summary.finalized, 1);
        assert!(shared.registry.held_jobs().is_empty());
        let report = rx.recv().await.unwrap();
        let failure = report.failure().unwrap();
        assert_eq!(failure.stage, FailureStage::Panicked);
        assert_eq!(failure.message, "remote layer exploded");
    }

    #[tokio::test]
    async fn test_teardown_panic_is_contained_to_job() {
        let shared = shared(Arc::new(TeardownPanicExecutor));
        shared.queue.push(Job::new(
            JobId(1),
            JobSpec::stateful(StepDescriptor::new("work"), 1),
        ))
        .unwrap();
        shared.queue.push(Job::new(
            JobId(2),
            JobSpec::stateless(StepDescriptor::new("work"), 3),
        ))
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = Worker::new(WorkerId(0), Arc::clone(&shared), tx).run().await;

        assert_eq!(summary.finalized, 2);
        assert_eq!(summary.steps, 4);
        assert_eq!(shared.active_workers.load(Ordering::SeqCst), 0);
        assert!(shared.registry.is_empty());

        let stateful = rx.recv().await.unwrap();
        assert_eq!(stateful.id, JobId(1));
        let failure = stateful.failure().unwrap();
        assert_eq!(failure.stage, FailureStage::EndSession);
        assert!(failure.message.contains("session close exploded"));

        let stateless = rx.recv().await.unwrap();
        assert_eq!(stateless.id, JobId(2));
        assert!(stateless.is_success());
    }

    #[tokio::test]
    async fn test_stop_releases_queued_sessions() {
        let shared = shared(Arc::new(CounterExecutor::new()));
        shared.queue.push(Job::new(
            JobId(1),
            JobSpec::stateless(StepDescriptor::new(INCREMENT_COUNTER), 2),
        ))
        .unwrap();
        shared.queue.push(Job::new(
            JobId(2),
            JobSpec::stateless(StepDescriptor::new(INCREMENT_COUNTER), 2),
        ))
        .unwrap();
        // job 1 already ran a step
        let session = shared.registry.bind(JobId(1));

        assert_eq!(shared.stop(), vec![JobId(1), JobId(2)]);
        assert!(shared.queue.is_empty());
        assert!(!shared.registry.is_alive(session.as_str()));
        assert!(shared.registry.is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = Worker::new(WorkerId(0), Arc::clone(&shared), tx).run().await;
        assert_eq!(summary, WorkerSummary::new(WorkerId(0)));
    }

    #[tokio::test]
    async fn test_requeue_after_stop_releases_session() {
        let shared = shared(Arc::new(CounterExecutor::new()));
        let job = Job::new(
            JobId(1),
            JobSpec::stateless(StepDescriptor::new(INCREMENT_COUNTER), 3),
        );
        shared.stop();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = Worker::new(WorkerId(0), Arc::clone(&shared), tx);

        // the step was already running when the queue closed
        worker.process(job).await;

        assert!(shared.queue.is_empty());
        assert!(shared.registry.is_empty());
        assert_eq!(worker.summary.steps, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_and_held_jobs_are_disjoint() {
        let checker = Arc::new(DisjointnessCheck::default());
        let shared = shared(checker.clone());
        let _ = checker.shared.set(Arc::clone(&shared));
        for id in 1..=4 {
            shared
                .queue
                .push(Job::new(
                    JobId(id),
                    JobSpec::stateful(StepDescriptor::new("work"), 3),
                ))
                .unwrap();
        }
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = Worker::new(WorkerId(0), Arc::clone(&shared), tx.clone());
        let second = Worker::new(WorkerId(1), Arc::clone(&shared), tx);
        let (a, b) = tokio::join!(first.run(), second.run());

        assert_eq!(a.finalized + b.finalized, 4);
        assert_eq!(checker.checks.load(Ordering::SeqCst), 12);
        assert_eq!(checker.violations.load(Ordering::SeqCst), 0);
        let mut reports = 0;
        while rx.try_recv().is_ok() {
            reports += 1;
        }
        assert_eq!(reports, 4);
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
