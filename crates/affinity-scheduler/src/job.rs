//! Multi-step jobs.

use std::{fmt, panic::AssertUnwindSafe};

use affinity_core::{
    JobId, RemoteStepExecutor, SessionContext, SessionReference, StepDescriptor, StepOutput,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    report::{FailureStage, JobFailure, JobOutcome, JobReport},
    worker::panic_message,
};

/// Whether a job's steps share one remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Every step is an independent remote call.
    Stateless,
    /// All steps run inside one session opened on the first step and
    /// closed during cleanup.
    Stateful,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stateless => f.write_str("stateless"),
            Self::Stateful => f.write_str("stateful"),
        }
    }
}

/// Description of a job submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    /// Remote call issued once per step.
    pub step: StepDescriptor,
    /// Read issued after the final step; its output becomes the result.
    #[serde(default)]
    pub verify: Option<StepDescriptor>,
    /// Step budget.
    pub steps: u32,
}

impl JobSpec {
    #[must_use]
    pub const fn new(kind: JobKind, step: StepDescriptor, steps: u32) -> Self {
        Self {
            kind,
            step,
            verify: None,
            steps,
        }
    }

    #[must_use]
    pub const fn stateless(step: StepDescriptor, steps: u32) -> Self {
        Self::new(JobKind::Stateless, step, steps)
    }

    #[must_use]
    pub const fn stateful(step: StepDescriptor, steps: u32) -> Self {
        Self::new(JobKind::Stateful, step, steps)
    }

    /// Issue `verify` after the final step.
    #[must_use]
    pub fn with_verify(mut self, verify: StepDescriptor) -> Self {
        self.verify = Some(verify);
        self
    }

    /// Check the spec can be scheduled.
    ///
    /// # Errors
    /// Returns a description of the problem for a zero step budget or an
    /// unnamed step.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps == 0 {
            return Err("step budget must be at least 1".into());
        }
        if self.step.name.trim().is_empty() {
            return Err("step name is empty".into());
        }
        if self.verify.as_ref().is_some_and(|v| v.name.trim().is_empty()) {
            return Err("verification step name is empty".into());
        }
        Ok(())
    }
}

/// A job in flight.
///
/// A `Job` value lives either in the queue or in exactly one worker, so its
/// fields are never touched concurrently.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    spec: JobSpec,
    executed: u32,
    session_open: bool,
    session: Option<SessionReference>,
    result: Option<StepOutput>,
    error: Option<JobFailure>,
    teardown_error: Option<JobFailure>,
}

impl Job {
    #[must_use]
    pub const fn new(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            executed: 0,
            session_open: false,
            session: None,
            result: None,
            error: None,
            teardown_error: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> JobKind {
        self.spec.kind
    }

    /// Human-readable name for diagnostics.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{} Job-{}", self.spec.kind, self.id)
    }

    /// Steps completed so far.
    #[must_use]
    pub const fn steps_executed(&self) -> u32 {
        self.executed
    }

    /// Session the job's steps ran in.
    #[must_use]
    pub const fn session(&self) -> Option<&SessionReference> {
        self.session.as_ref()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&JobFailure> {
        self.error.as_ref()
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.executed == self.spec.steps || self.error.is_some()
    }

    /// Run exactly one step.
    ///
    /// Any executor error becomes the job's terminal error; the step is not
    /// retried.
    pub async fn run_next_step(
        &mut self,
        executor: &dyn RemoteStepExecutor,
        ctx: &SessionContext,
    ) {
        if self.is_finished() {
            tracing::warn!(job = %self.name(), "Step requested for finished job");
            return;
        }
        if self.session.is_none() {
            self.session = Some(ctx.session.clone());
        }
        if let Err(failure) = self.step(executor, ctx).await {
            self.error = Some(failure);
        }
    }

    async fn step(
        &mut self,
        executor: &dyn RemoteStepExecutor,
        ctx: &SessionContext,
    ) -> Result<(), JobFailure> {
        if self.spec.kind == JobKind::Stateful && self.executed == 0 && !self.session_open {
            executor
                .begin_session(ctx)
                .await
                .map_err(|e| JobFailure::new(FailureStage::BeginSession, e))?;
            self.session_open = true;
        }

        let number = self.executed + 1;
        let output = executor
            .execute_step(ctx, &self.spec.step)
            .await
            .map_err(|e| JobFailure::new(FailureStage::Step(number), e))?;
        self.executed = number;

        if self.executed == self.spec.steps {
            let result = match &self.spec.verify {
                Some(verify) => executor
                    .execute_step(ctx, verify)
                    .await
                    .map_err(|e| JobFailure::new(FailureStage::Verify, e))?,
                None => output,
            };
            self.result = Some(result);
        }
        Ok(())
    }

    /// Record a panic that escaped a step. An earlier error is kept.
    pub fn record_panic(&mut self, message: impl Into<String>) {
        self.record_failure(JobFailure {
            stage: FailureStage::Panicked,
            message: message.into(),
        });
    }

    pub(crate) fn record_failure(&mut self, failure: JobFailure) {
        if self.error.is_none() {
            self.error = Some(failure);
        }
    }

    /// Close the job's session if one was opened, emit the summary and
    /// produce the terminal report.
    pub async fn cleanup(
        mut self,
        executor: &dyn RemoteStepExecutor,
        ctx: &SessionContext,
    ) -> JobReport {
        if self.session_open {
            let closed = AssertUnwindSafe(executor.end_session(ctx))
                .catch_unwind()
                .await;
            let failure = match closed {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(JobFailure::new(FailureStage::EndSession, e)),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(job = %self.name(), %message, "End session panicked");
                    Some(JobFailure::new(
                        FailureStage::EndSession,
                        format!("panicked: {message}"),
                    ))
                }
            };
            self.teardown_error = failure;
            self.session_open = false;
        }

        let report = self.into_report();
        match &report.outcome {
            JobOutcome::Succeeded { result } => {
                tracing::info!(job = %report.name, %result, "Task finished successfully");
            }
            JobOutcome::Failed { cause, teardown } => {
                tracing::warn!(
                    job = %report.name,
                    %cause,
                    teardown = teardown.as_ref().map(tracing::field::display),
                    "Task finished with error"
                );
            }
        }
        report
    }

    fn into_report(self) -> JobReport {
        let name = self.name();
        let outcome = match (self.error, self.teardown_error) {
            (Some(cause), teardown) => JobOutcome::Failed { cause, teardown },
            (None, Some(cause)) => JobOutcome::Failed {
                cause,
                teardown: None,
            },
            (None, None) => JobOutcome::Succeeded {
                result: self.result.unwrap_or(Value::Null),
            },
        };

        JobReport {
            id: self.id,
            name,
            kind: self.spec.kind,
            steps_executed: self.executed,
            session: self.session,
            outcome,
        }
    }
}
