//! Terminal job reports.

use std::fmt;

use affinity_core::{JobId, SessionReference, StepOutput, WorkerId};
use serde::{Deserialize, Serialize};

use crate::job::JobKind;

/// Where a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Opening the remote session.
    BeginSession,
    /// The numbered step (1-based).
    Step(u32),
    /// The verification read after the final step.
    Verify,
    /// Closing the remote session during cleanup.
    EndSession,
    /// A panic escaped the step.
    Panicked,
    /// The session registry had no entry for the job.
    Registry,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeginSession => f.write_str("begin session"),
            Self::Step(n) => write!(f, "step {n}"),
            Self::Verify => f.write_str("verification read"),
            Self::EndSession => f.write_str("end session"),
            Self::Panicked => f.write_str("panic"),
            Self::Registry => f.write_str("session registry"),
        }
    }
}

/// A recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: FailureStage,
    pub message: String,
}

impl JobFailure {
    #[must_use]
    pub fn new(stage: FailureStage, cause: impl fmt::Display) -> Self {
        Self {
            stage,
            message: cause.to_string(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.message)
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// All steps ran.
    Succeeded { result: StepOutput },
    /// A step or the session teardown failed.
    Failed {
        cause: JobFailure,
        /// Teardown failure recorded after an earlier step failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        teardown: Option<JobFailure>,
    },
}

/// Terminal report of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    pub steps_executed: u32,
    /// Session the job's steps ran in.
    pub session: Option<SessionReference>,
    pub outcome: JobOutcome,
}

impl JobReport {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded { .. })
    }

    /// The primary failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&JobFailure> {
        match &self.outcome {
            JobOutcome::Succeeded { .. } => None,
            JobOutcome::Failed { cause, .. } => Some(cause),
        }
    }

    /// Result payload of a successful job.
    #[must_use]
    pub const fn result(&self) -> Option<&StepOutput> {
        match &self.outcome {
            JobOutcome::Succeeded { result } => Some(result),
            JobOutcome::Failed { .. } => None,
        }
    }
}

/// What one worker did before retiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker: WorkerId,
    /// Steps executed, including failed and panicked ones.
    pub steps: usize,
    /// Jobs this worker finalized.
    pub finalized: usize,
}

impl WorkerSummary {
    #[must_use]
    pub const fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            steps: 0,
            finalized: 0,
        }
    }
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// One report per finalized job, ordered by job id.
    pub jobs: Vec<JobReport>,
    /// Seeded jobs that were not finalized within the run.
    ///
    /// A job that was mid-step when the run was interrupted is listed here
    /// even though its detached worker still closes its session afterwards.
    pub abandoned: Vec<JobId>,
    /// Summaries of the workers that retired, ordered by worker id. Empty
    /// for workers still detached after an interruption.
    pub workers: Vec<WorkerSummary>,
    /// Whether the run was stopped by a shutdown signal.
    pub interrupted: bool,
}

impl RunReport {
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<&JobReport> {
        self.jobs.iter().find(|report| report.id == id)
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|report| report.is_success()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.jobs.len() - self.succeeded()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_failure_display() {
        let failure = JobFailure::new(FailureStage::Step(3), "connection reset");
        assert_eq!(failure.to_string(), "step 3 failed: connection reset");
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = JobOutcome::Failed {
            cause: JobFailure::new(FailureStage::Step(2), "boom"),
            teardown: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["cause"]["stage"], json!({ "step": 2 }));
        assert!(json.get("teardown").is_none());
    }

    #[test]
    fn test_run_report_counts() {
        let ok = JobReport {
            id: JobId(1),
            name: "stateless Job-1".into(),
            kind: JobKind::Stateless,
            steps_executed: 2,
            session: None,
            outcome: JobOutcome::Succeeded {
                result: json!({ "value": 0 }),
            },
        };
        let failed = JobReport {
            id: JobId(2),
            name: "stateful Job-2".into(),
            kind: JobKind::Stateful,
            steps_executed: 0,
            session: None,
            outcome: JobOutcome::Failed {
                cause: JobFailure::new(FailureStage::BeginSession, "refused"),
                teardown: None,
            },
        };
        let report = RunReport {
            jobs: vec![ok, failed],
            ..RunReport::default()
        };

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            report.get(JobId(2)).and_then(JobReport::failure).map(|f| f.stage),
            Some(FailureStage::BeginSession)
        );
        assert_eq!(report.get(JobId(1)).and_then(JobReport::result), Some(&json!({ "value": 0 })));
    }
}
