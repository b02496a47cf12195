//! In-memory stateful counter backend.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use affinity_core::{
    ExecutorError, JobId, RemoteStepExecutor, SessionContext, SessionReference, StepDescriptor,
    StepOutput,
};
use async_trait::async_trait;
use serde_json::json;

/// Step that adds `by` (default 1) to the counter.
pub const INCREMENT_COUNTER: &str = "increment_counter";

/// Step that reads the counter.
pub const GET_COUNTER: &str = "get_counter";

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionReference, i64>,
    calls_per_job: HashMap<JobId, u32>,
    step_faults: HashMap<JobId, u32>,
    teardown_faults: HashSet<JobId>,
}

/// Remote backend keeping one counter per open session.
///
/// Calls made inside a session opened with `begin_session` share that
/// session's counter. Calls outside a session run against a fresh counter
/// that is discarded afterwards, so a stateless read always sees zero.
pub struct CounterExecutor {
    inner: Mutex<Inner>,
    calls: AtomicUsize,
    latency: Duration,
}

impl CounterExecutor {
    /// Create a backend answering without delay.
    #[must_use]
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Create a backend that waits `latency` before answering each step.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            calls: AtomicUsize::new(0),
            latency,
        }
    }

    /// Fail the `call`-th step call (1-based, verification reads included)
    /// made for `job`.
    pub fn fail_step(&self, job: JobId, call: u32) {
        self.lock().step_faults.insert(job, call);
    }

    /// Fail `end_session` for `job`. The session is still dropped.
    pub fn fail_end_session(&self, job: JobId) {
        self.lock().teardown_faults.insert(job);
    }

    /// Number of sessions currently open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Counter value of an open session.
    #[must_use]
    pub fn session_counter(&self, session: &SessionReference) -> Option<i64> {
        self.lock().sessions.get(session).copied()
    }

    /// Total number of step calls served.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CounterExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(counter: &mut i64, step: &StepDescriptor) -> Result<StepOutput, ExecutorError> {
    match step.name.as_str() {
        INCREMENT_COUNTER => {
            let by = step
                .param("by")
                .map_or(Some(1), serde_json::Value::as_i64)
                .ok_or_else(|| ExecutorError::Remote("parameter 'by' must be an integer".into()))?;
            *counter += by;
            Ok(json!({ "counter": *counter }))
        }
        GET_COUNTER => Ok(json!({ "value": *counter })),
        other => Err(ExecutorError::UnknownStep(other.to_string())),
    }
}

#[async_trait]
impl RemoteStepExecutor for CounterExecutor {
    async fn begin_session(&self, ctx: &SessionContext) -> Result<(), ExecutorError> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(&ctx.session) {
            return Err(ExecutorError::SessionAlreadyOpen(ctx.session.clone()));
        }
        inner.sessions.insert(ctx.session.clone(), 0);
        tracing::debug!(session = %ctx.session, job = %ctx.job, "Remote session opened");
        Ok(())
    }

    async fn end_session(&self, ctx: &SessionContext) -> Result<(), ExecutorError> {
        let mut inner = self.lock();
        if inner.sessions.remove(&ctx.session).is_none() {
            return Err(ExecutorError::NoSession(ctx.session.clone()));
        }
        tracing::debug!(session = %ctx.session, job = %ctx.job, "Remote session closed");
        if inner.teardown_faults.remove(&ctx.job) {
            return Err(ExecutorError::Remote(format!(
                "injected teardown failure for job {}",
                ctx.job
            )));
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        ctx: &SessionContext,
        step: &StepDescriptor,
    ) -> Result<StepOutput, ExecutorError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.lock();
        let call = {
            let calls = inner.calls_per_job.entry(ctx.job).or_insert(0);
            *calls += 1;
            *calls
        };
        if inner.step_faults.get(&ctx.job) == Some(&call) {
            return Err(ExecutorError::Remote(format!(
                "injected failure on call {call} of job {}",
                ctx.job
            )));
        }

        match inner.sessions.get_mut(&ctx.session) {
            Some(counter) => apply(counter, step),
            None => apply(&mut 0, step),
        }
    }
}
